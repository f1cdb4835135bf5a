//! The two request flows.
//!
//! Flow A (`recognize_and_analyze`): audio bytes are ingested into a transient
//! WAV file and decoded, then phone recognition and acoustic analysis run
//! concurrently and are joined into a [`PhoneticResult`].
//!
//! Flow B (`synthesize_and_verify`): a phone sequence is rendered to a
//! transient WAV file, loaded back and analyzed into a [`SynthesisResult`].
//!
//! Every transient file is owned by a guard, so it is deleted on success, on
//! failure and when the caller drops the flow future part way through.


use crate::analysis::{AcousticAnalyzer, AcousticReport};
use crate::config::{AppConfig, LanguageCode, VoiceId};
use crate::recognize::{AllosaurusFactory, PhoneticString, RecognitionError, RecognizerInitError, RecognizerResource};
use crate::render::{EspeakRenderer, RendererGateway, SynthesisError};
use crate::waveform::{DecodeError, TransientAudioFile, WaveformBuffer};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("scratch file error: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// One-line message fit for an end user.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Decode(e) => {
                format!("Could not read the recording ({e}). Please provide a WAV file.")
            }
            PipelineError::Recognition(RecognitionError::Init(e)) => {
                format!("Phone recognition is unavailable: {e}. Restart after fixing the recognizer installation.")
            }
            PipelineError::Recognition(e) => format!("Phone recognition failed: {e}"),
            PipelineError::Synthesis(SynthesisError::EmptyInput) => {
                "Please enter IPA characters.".to_owned()
            }
            PipelineError::Synthesis(e) => format!("Synthesis Error: {e}"),
            PipelineError::Scratch(e) => format!("Could not create a temporary audio file: {e}"),
            PipelineError::Task(e) => format!("Internal error: {e}"),
        }
    }

    /// Recognizer initialization failure, if that is what this is.
    pub fn as_recognizer_init(&self) -> Option<&RecognizerInitError> {
        match self {
            PipelineError::Recognition(RecognitionError::Init(e)) => Some(e),
            _ => None,
        }
    }
}

/// Output of Flow A.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneticResult {
    pub ipa: PhoneticString,
    pub language: LanguageCode,
    #[serde(flatten)]
    pub report: AcousticReport,
}

/// Output of Flow B.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub phonetic: PhoneticString,
    pub voice: VoiceId,
    /// The rendered audio, for playback or saving.
    #[serde(skip)]
    pub audio: WaveformBuffer,
    #[serde(flatten)]
    pub report: AcousticReport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    RecognizeAndAnalyze,
    SynthesizeAndVerify,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::RecognizeAndAnalyze => "recognize_and_analyze",
            Flow::SynthesizeAndVerify => "synthesize_and_verify",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Ingesting,
    Recognizing,
    Analyzing,
    Rendering,
    Assembled,
    Done,
    Failed,
}

/// Logs each state change of one flow invocation.
struct FlowTracker {
    flow: Flow,
    state: FlowState,
    started: Instant,
}

impl FlowTracker {
    fn start(flow: Flow) -> Self {
        tracing::debug!(flow = flow.as_str(), state = ?FlowState::Idle, "flow started");
        Self {
            flow,
            state: FlowState::Idle,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: FlowState) {
        tracing::debug!(
            flow = self.flow.as_str(),
            from = ?self.state,
            to = ?next,
            "flow transition"
        );
        self.state = next;
    }

    fn finish<T>(mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.enter(FlowState::Done);
                tracing::info!(flow = self.flow.as_str(), elapsed_ms, "flow finished");
            }
            Err(e) => {
                let failed_in = self.state;
                self.enter(FlowState::Failed);
                tracing::warn!(
                    flow = self.flow.as_str(),
                    failed_in = ?failed_in,
                    elapsed_ms,
                    error = %e,
                    "flow failed"
                );
            }
        }
        result
    }
}

/// Runs both flows over a shared recognizer, renderer and analyzer.
pub struct PipelineOrchestrator {
    recognizer: Arc<RecognizerResource>,
    renderer: RendererGateway,
    analyzer: AcousticAnalyzer,
    scratch_dir: PathBuf,
}

impl PipelineOrchestrator {
    pub fn new(
        recognizer: Arc<RecognizerResource>,
        renderer: RendererGateway,
        analyzer: AcousticAnalyzer,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            recognizer,
            renderer,
            analyzer,
            scratch_dir,
        }
    }

    /// Production wiring: Allosaurus for recognition, eSpeak NG for rendering.
    pub fn from_config(config: &AppConfig) -> Self {
        let recognizer = RecognizerResource::new(AllosaurusFactory::new(config.recognizer.clone()));
        Self::new(
            Arc::new(recognizer),
            RendererGateway::new(EspeakRenderer::new(&config.renderer)),
            AcousticAnalyzer::new(config.analysis),
            config.scratch_dir(),
        )
    }

    pub fn recognizer(&self) -> &Arc<RecognizerResource> {
        &self.recognizer
    }

    pub fn analyzer(&self) -> &AcousticAnalyzer {
        &self.analyzer
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Flow A over a WAV file on disk.
    pub async fn recognize_file(
        &self,
        path: &Path,
        hint: LanguageCode,
    ) -> Result<PhoneticResult, PipelineError> {
        let bytes = tokio::fs::read(path).await.map_err(DecodeError::Io)?;
        self.recognize_and_analyze(Bytes::from(bytes), hint).await
    }

    /// Flow A: speech audio to IPA plus acoustic report.
    pub async fn recognize_and_analyze(
        &self,
        audio: Bytes,
        hint: LanguageCode,
    ) -> Result<PhoneticResult, PipelineError> {
        let mut tracker = FlowTracker::start(Flow::RecognizeAndAnalyze);
        let result = self.run_recognize(&mut tracker, audio, hint).await;
        tracker.finish(result)
    }

    async fn run_recognize(
        &self,
        tracker: &mut FlowTracker,
        audio: Bytes,
        hint: LanguageCode,
    ) -> Result<PhoneticResult, PipelineError> {
        tracker.enter(FlowState::Ingesting);
        let (input, buffer) = self.ingest(audio).await?;
        tracing::debug!(
            path = %input.path().display(),
            frames = buffer.frames(),
            sample_rate = buffer.sample_rate(),
            "ingested audio"
        );

        // Recognition reads the file, analysis reads the buffer; they run side by side.
        tracker.enter(FlowState::Recognizing);
        let analysis = self.analyze_in_background(Arc::new(buffer));
        tracker.enter(FlowState::Analyzing);
        let recognition = async {
            self.recognizer
                .recognize(input.path(), hint)
                .await
                .map_err(PipelineError::from)
        };
        let (ipa, report) = tokio::try_join!(recognition, analysis)?;

        tracker.enter(FlowState::Assembled);
        release(input);
        Ok(PhoneticResult {
            ipa,
            language: hint,
            report,
        })
    }

    /// Writes the bytes to a transient file and decodes them from there.
    async fn ingest(&self, audio: Bytes) -> Result<(TransientAudioFile, WaveformBuffer), PipelineError> {
        let dir = self.scratch_dir.clone();
        tokio::task::spawn_blocking(move || {
            let file = TransientAudioFile::from_bytes_in(&dir, &audio).map_err(PipelineError::Scratch)?;
            let buffer = file.load()?;
            Ok::<_, PipelineError>((file, buffer))
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    /// Starts analysis on the blocking pool right away.
    fn analyze_in_background(
        &self,
        buffer: Arc<WaveformBuffer>,
    ) -> impl Future<Output = Result<AcousticReport, PipelineError>> {
        let analyzer = self.analyzer.clone();
        let handle = tokio::task::spawn_blocking(move || analyzer.analyze(&buffer));
        async move { handle.await.map_err(|e| PipelineError::Task(e.to_string())) }
    }

    /// Flow B: render phones with a voice, then analyze the rendering.
    pub async fn synthesize_and_verify(
        &self,
        phonetic: &PhoneticString,
        voice: &VoiceId,
    ) -> Result<SynthesisResult, PipelineError> {
        let mut tracker = FlowTracker::start(Flow::SynthesizeAndVerify);
        let result = self.run_synthesize(&mut tracker, phonetic, voice).await;
        tracker.finish(result)
    }

    async fn run_synthesize(
        &self,
        tracker: &mut FlowTracker,
        phonetic: &PhoneticString,
        voice: &VoiceId,
    ) -> Result<SynthesisResult, PipelineError> {
        tracker.enter(FlowState::Rendering);
        if phonetic.is_empty() {
            return Err(SynthesisError::EmptyInput.into());
        }
        let output = TransientAudioFile::reserve_in(&self.scratch_dir).map_err(PipelineError::Scratch)?;
        let audio = Arc::new(self.renderer.synthesize(phonetic, voice, &output).await?);

        tracker.enter(FlowState::Analyzing);
        let report = self.analyze_in_background(Arc::clone(&audio)).await?;

        tracker.enter(FlowState::Assembled);
        release(output);
        let audio = Arc::try_unwrap(audio).unwrap_or_else(|shared| WaveformBuffer::clone(&shared));
        Ok(SynthesisResult {
            phonetic: phonetic.clone(),
            voice: voice.clone(),
            audio,
            report,
        })
    }
}

/// Deletes a transient file now; a failure only leaks a temp file, so it is logged.
fn release(file: TransientAudioFile) {
    let path = file.path().to_path_buf();
    if let Err(e) = file.close() {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove transient audio file");
    }
}
