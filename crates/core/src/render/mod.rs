//! IPA to audio rendering through an external phoneme synthesizer.

mod espeak;

use crate::config::VoiceId;
use crate::recognize::PhoneticString;
use crate::waveform::{DecodeError, TransientAudioFile, WaveformBuffer};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use espeak::{quote_phonemes, EspeakRenderer};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderRequest {
    pub phonetic: PhoneticString,
    pub voice: VoiceId,
    /// Where the backend must write its WAV output.
    pub output: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum SynthesisError {
    #[error("phonetic input is empty")]
    EmptyInput,

    #[error("failed to launch renderer: {0}")]
    Spawn(String),

    #[error("renderer timed out after {0:?}")]
    TimedOut(Duration),

    #[error("renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("renderer produced no output audio")]
    NoOutput,

    #[error("renderer output is not decodable audio: {0}")]
    InvalidOutput(#[source] DecodeError),

    #[error("renderer produced zero-length audio")]
    EmptyAudio,

    #[error("failed to prepare renderer output: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can write a WAV rendering of a phone sequence to a path.
pub trait RenderBackend: Send + Sync {
    fn render(&self, request: RenderRequest) -> BoxFuture<'_, Result<(), SynthesisError>>;
}

/// Validates input, drives a [`RenderBackend`] and loads what it wrote.
#[derive(Clone)]
pub struct RendererGateway {
    backend: Arc<dyn RenderBackend>,
}

impl RendererGateway {
    pub fn new(backend: impl RenderBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Renders into `output` and returns the decoded audio.
    ///
    /// Never yields a zero-length buffer: empty or missing output is an error.
    pub async fn synthesize(
        &self,
        phonetic: &PhoneticString,
        voice: &VoiceId,
        output: &TransientAudioFile,
    ) -> Result<WaveformBuffer, SynthesisError> {
        if phonetic.is_empty() {
            return Err(SynthesisError::EmptyInput);
        }

        let started = Instant::now();
        let request = RenderRequest {
            phonetic: phonetic.clone(),
            voice: voice.clone(),
            output: output.path().to_path_buf(),
        };
        self.backend.render(request).await?;

        if !output.is_populated() {
            return Err(SynthesisError::NoOutput);
        }

        let path = output.path().to_path_buf();
        let audio = tokio::task::spawn_blocking(move || WaveformBuffer::load(&path))
            .await
            .map_err(|e| SynthesisError::Io(std::io::Error::other(e)))?
            .map_err(SynthesisError::InvalidOutput)?;
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        tracing::debug!(
            voice = %voice,
            phones = phonetic.len(),
            duration_s = audio.duration(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered phones"
        );
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Tone,
        Nothing,
        Garbage,
        Silence,
    }

    struct StubBackend {
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl RenderBackend for StubBackend {
        fn render(&self, request: RenderRequest) -> BoxFuture<'_, Result<(), SynthesisError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match self.behaviour {
                    Behaviour::Tone => {
                        let buf = WaveformBuffer::from_samples(vec![0.3; 2205], 1, 22_050)
                            .expect("valid");
                        buf.write_wav(&request.output).map_err(SynthesisError::InvalidOutput)?;
                    }
                    Behaviour::Nothing => {}
                    Behaviour::Garbage => std::fs::write(&request.output, b"definitely not riff")?,
                    Behaviour::Silence => {
                        let buf = WaveformBuffer::from_samples(Vec::new(), 1, 22_050).expect("valid");
                        buf.write_wav(&request.output).map_err(SynthesisError::InvalidOutput)?;
                    }
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn gateway(behaviour: Behaviour) -> (RendererGateway, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = StubBackend {
            behaviour,
            calls: Arc::clone(&calls),
        };
        (RendererGateway::new(backend), calls)
    }

    fn voice() -> VoiceId {
        VoiceId::new("en-us").expect("voice")
    }

    #[tokio::test]
    async fn empty_input_never_reaches_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = TransientAudioFile::reserve_in(dir.path()).expect("reserve");
        let (gw, calls) = gateway(Behaviour::Tone);
        let err = gw
            .synthesize(&PhoneticString::parse("  "), &voice(), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::EmptyInput));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loads_rendered_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = TransientAudioFile::reserve_in(dir.path()).expect("reserve");
        let (gw, _) = gateway(Behaviour::Tone);
        let audio = gw
            .synthesize(&PhoneticString::parse("h ə l oʊ"), &voice(), &out)
            .await
            .expect("rendered");
        assert_eq!(audio.sample_rate(), 22_050);
        assert!((audio.duration() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = TransientAudioFile::reserve_in(dir.path()).expect("reserve");
        let (gw, _) = gateway(Behaviour::Nothing);
        let err = gw
            .synthesize(&PhoneticString::parse("a"), &voice(), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::NoOutput));
    }

    #[tokio::test]
    async fn undecodable_output_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = TransientAudioFile::reserve_in(dir.path()).expect("reserve");
        let (gw, _) = gateway(Behaviour::Garbage);
        let err = gw
            .synthesize(&PhoneticString::parse("a"), &voice(), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidOutput(_)), "{err}");
    }

    #[tokio::test]
    async fn zero_length_audio_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = TransientAudioFile::reserve_in(dir.path()).expect("reserve");
        let (gw, _) = gateway(Behaviour::Silence);
        let err = gw
            .synthesize(&PhoneticString::parse("a"), &voice(), &out)
            .await
            .unwrap_err();
        // A header with no data chunk payload may not even decode.
        assert!(
            matches!(err, SynthesisError::EmptyAudio | SynthesisError::InvalidOutput(_)),
            "{err}"
        );
    }
}
