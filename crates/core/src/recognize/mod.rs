//! Speech to IPA phone recognition.
//!
//! The recognizer model is expensive to bring up, so [`RecognizerResource`]
//! initializes it lazily, at most once per process, and then shares it
//! between every flow. An initialization failure is remembered and returned
//! to every later caller instead of being retried.

mod allosaurus;

use crate::config::LanguageCode;
use crate::waveform::{DecodeError, TransientAudioFile, WaveformBuffer};
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};

pub use allosaurus::{AllosaurusFactory, AllosaurusRecognizer};

/// Space-separated IPA phone tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhoneticString {
    tokens: Vec<String>,
}

impl PhoneticString {
    /// Splits on any whitespace; leading, trailing and repeated blanks vanish.
    pub fn parse(text: &str) -> Self {
        Self {
            tokens: text.split_whitespace().map(str::to_owned).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for PhoneticString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

impl FromStr for PhoneticString {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for PhoneticString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Failure to bring the recognizer up. Cloned out of the cache for every caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognizerInitError {
    #[error("recognizer runtime unavailable: {0}")]
    Unavailable(String),

    #[error("recognizer model failed to load: {0}")]
    ModelLoad(String),

    #[error("recognizer initialization timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(thiserror::Error, Debug)]
pub enum RecognitionError {
    #[error(transparent)]
    Init(#[from] RecognizerInitError),

    #[error("recognizer worker I/O failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("recognizer timed out after {0:?}")]
    TimedOut(Duration),

    #[error("recognizer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("recognizer rejected the audio: {0}")]
    Rejected(String),

    #[error("audio path {} cannot be passed to the recognizer", .0.display())]
    UnsupportedPath(PathBuf),

    #[error("failed to materialize audio for recognition: {0}")]
    Materialize(#[from] DecodeError),
}

/// A loaded recognizer that turns a WAV file into phones.
pub trait PhoneRecognizer: Send + Sync {
    fn recognize(
        &self,
        audio: PathBuf,
        hint: LanguageCode,
    ) -> BoxFuture<'_, Result<PhoneticString, RecognitionError>>;

    /// Whether concurrent `recognize` calls are safe. Non-reentrant
    /// recognizers are serialized by [`RecognizerResource`].
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Performs the one-time, expensive load of a [`PhoneRecognizer`].
pub trait RecognizerFactory: Send + Sync {
    fn initialize(&self) -> BoxFuture<'_, Result<Arc<dyn PhoneRecognizer>, RecognizerInitError>>;
}

struct Loaded {
    recognizer: Arc<dyn PhoneRecognizer>,
    gate: Option<Mutex<()>>,
}

/// Process-wide handle to the lazily initialized recognizer.
pub struct RecognizerResource {
    factory: Box<dyn RecognizerFactory>,
    instance: OnceCell<Result<Loaded, RecognizerInitError>>,
}

impl RecognizerResource {
    pub fn new(factory: impl RecognizerFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            instance: OnceCell::new(),
        }
    }

    /// True once initialization has completed, successfully or not.
    pub fn is_initialized(&self) -> bool {
        self.instance.initialized()
    }

    async fn instance(&self) -> Result<&Loaded, RecognizerInitError> {
        let outcome = self
            .instance
            .get_or_init(|| async {
                tracing::info!("initializing phone recognizer");
                let started = Instant::now();
                match self.factory.initialize().await {
                    Ok(recognizer) => {
                        let reentrant = recognizer.is_reentrant();
                        tracing::info!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            reentrant,
                            "phone recognizer ready"
                        );
                        Ok(Loaded {
                            gate: (!reentrant).then(|| Mutex::new(())),
                            recognizer,
                        })
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "phone recognizer initialization failed; recognition stays disabled"
                        );
                        Err(e)
                    }
                }
            })
            .await;
        outcome.as_ref().map_err(|e| e.clone())
    }

    /// Forces initialization without recognizing anything.
    pub async fn warm_up(&self) -> Result<(), RecognizerInitError> {
        self.instance().await.map(|_| ())
    }

    pub async fn recognize(
        &self,
        audio: &Path,
        hint: LanguageCode,
    ) -> Result<PhoneticString, RecognitionError> {
        let loaded = self.instance().await?;
        let _serialized = match &loaded.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let started = Instant::now();
        let phones = loaded.recognizer.recognize(audio.to_path_buf(), hint).await?;
        tracing::debug!(
            language = hint.as_str(),
            phones = phones.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recognized phones"
        );
        Ok(phones)
    }

    /// Recognizes an in-memory buffer by materializing it under `scratch_dir`.
    pub async fn recognize_buffer(
        &self,
        buffer: &WaveformBuffer,
        hint: LanguageCode,
        scratch_dir: &Path,
    ) -> Result<PhoneticString, RecognitionError> {
        let file = TransientAudioFile::from_waveform_in(scratch_dir, buffer)?;
        self.recognize(file.path(), hint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRecognizer {
        phones: &'static str,
        reentrant: bool,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl PhoneRecognizer for FixedRecognizer {
        fn recognize(
            &self,
            audio: PathBuf,
            _hint: LanguageCode,
        ) -> BoxFuture<'_, Result<PhoneticString, RecognitionError>> {
            async move {
                assert!(audio.exists(), "audio file must exist during recognition");
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(PhoneticString::parse(self.phones))
            }
            .boxed()
        }

        fn is_reentrant(&self) -> bool {
            self.reentrant
        }
    }

    #[derive(Default, Clone)]
    struct Counters {
        inits: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    struct CountingFactory {
        counters: Counters,
        reentrant: bool,
        fail: bool,
    }

    impl RecognizerFactory for CountingFactory {
        fn initialize(
            &self,
        ) -> BoxFuture<'_, Result<Arc<dyn PhoneRecognizer>, RecognizerInitError>> {
            async move {
                self.counters.inits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                if self.fail {
                    return Err(RecognizerInitError::ModelLoad("weights missing".into()));
                }
                Ok(Arc::new(FixedRecognizer {
                    phones: "  h ə  l oʊ ",
                    reentrant: self.reentrant,
                    in_flight: Arc::clone(&self.counters.in_flight),
                    max_in_flight: Arc::clone(&self.counters.max_in_flight),
                }) as Arc<dyn PhoneRecognizer>)
            }
            .boxed()
        }
    }

    fn resource(reentrant: bool, fail: bool) -> (Arc<RecognizerResource>, Counters) {
        let counters = Counters::default();
        let factory = CountingFactory {
            counters: counters.clone(),
            reentrant,
            fail,
        };
        (Arc::new(RecognizerResource::new(factory)), counters)
    }

    fn wav_in(dir: &Path) -> TransientAudioFile {
        let buf = WaveformBuffer::from_samples(vec![0.0; 1600], 1, 16_000).expect("valid");
        TransientAudioFile::from_waveform_in(dir, &buf).expect("wav")
    }

    #[test]
    fn phonetic_string_normalizes_whitespace() {
        let p = PhoneticString::parse("\t h  ə\nl   oʊ  ");
        assert_eq!(p.tokens(), ["h", "ə", "l", "oʊ"]);
        assert_eq!(p.to_string(), "h ə l oʊ");
        assert!(PhoneticString::parse("   ").is_empty());
        let parsed: PhoneticString = "a b".parse().expect("infallible");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn phonetic_string_serializes_as_text() {
        let json = serde_json::to_string(&PhoneticString::parse("t ɛ s t")).expect("json");
        assert_eq!(json, "\"t ɛ s t\"");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_initialization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = Arc::new(wav_in(dir.path()));
        let (res, counters) = resource(true, false);
        assert!(!res.is_initialized());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let res = Arc::clone(&res);
                let file = Arc::clone(&file);
                tokio::spawn(async move { res.recognize(file.path(), LanguageCode::Eng).await })
            })
            .collect();
        for h in handles {
            let phones = h.await.expect("join").expect("recognized");
            assert_eq!(phones.to_string(), "h ə l oʊ");
        }
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
        assert!(res.is_initialized());
    }

    #[tokio::test]
    async fn failed_initialization_is_cached_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = wav_in(dir.path());
        let (res, counters) = resource(true, true);
        for _ in 0..3 {
            let err = res.recognize(file.path(), LanguageCode::Eng).await.unwrap_err();
            assert!(matches!(
                err,
                RecognitionError::Init(RecognizerInitError::ModelLoad(_))
            ));
        }
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
        assert!(res.warm_up().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn non_reentrant_recognizer_is_serialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = Arc::new(wav_in(dir.path()));
        let (res, counters) = resource(false, false);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let res = Arc::clone(&res);
                let file = Arc::clone(&file);
                tokio::spawn(async move { res.recognize(file.path(), LanguageCode::Jpn).await })
            })
            .collect();
        for h in handles {
            h.await.expect("join").expect("recognized");
        }
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recognize_buffer_cleans_up_its_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (res, _) = resource(true, false);
        let buf = WaveformBuffer::from_samples(vec![0.1; 800], 1, 8_000).expect("valid");
        let phones = res
            .recognize_buffer(&buf, LanguageCode::Spa, dir.path())
            .await
            .expect("recognized");
        assert_eq!(phones.len(), 4);
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 0);
    }
}
