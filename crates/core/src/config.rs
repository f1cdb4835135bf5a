use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_LANGUAGE: &str = "eng";
pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_ESPEAK_BINARY: &str = "espeak-ng";
pub const DEFAULT_RECOGNIZER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RENDERER_TIMEOUT_SECS: u64 = 30;
pub const ENV_PYTHON: &str = "LINGUAPHON_PYTHON";
pub const ENV_ALLOSAURUS_MODEL: &str = "LINGUAPHON_ALLOSAURUS_MODEL";
pub const ENV_ESPEAK_BINARY: &str = "LINGUAPHON_ESPEAK";
pub const ENV_SCRATCH_DIR: &str = "LINGUAPHON_SCRATCH_DIR";

/// Target phonology. Used as the recognizer's prior and to pick a renderer voice.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LanguageCode {
    #[default]
    Eng,
    Cmn,
    Jpn,
    Spa,
    Fra,
}

impl LanguageCode {
    pub const ALL: [LanguageCode; 5] = [
        LanguageCode::Eng,
        LanguageCode::Cmn,
        LanguageCode::Jpn,
        LanguageCode::Spa,
        LanguageCode::Fra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageCode::Eng => "eng",
            LanguageCode::Cmn => "cmn",
            LanguageCode::Jpn => "jpn",
            LanguageCode::Spa => "spa",
            LanguageCode::Fra => "fra",
        }
    }

    /// Renderer voice paired with this phonology.
    pub fn voice(&self) -> VoiceId {
        let v = match self {
            LanguageCode::Eng => "en-us",
            LanguageCode::Cmn => "zh",
            LanguageCode::Jpn => "ja",
            LanguageCode::Spa => "es",
            LanguageCode::Fra => "fr",
        };
        VoiceId(v.to_owned())
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            LanguageCode::Eng => "English",
            LanguageCode::Cmn => "Mandarin",
            LanguageCode::Jpn => "Japanese",
            LanguageCode::Spa => "Spanish",
            LanguageCode::Fra => "French",
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LanguageCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_lowercase();
        LanguageCode::ALL
            .into_iter()
            .find(|l| l.as_str() == code)
            .ok_or_else(|| ConfigError::UnknownLanguage(s.to_owned()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceId(pub String);

impl VoiceId {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyVoice);
        }
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short-time analysis parameters. Times are in seconds, frequencies in Hz.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    pub time_step: f64,
    pub pitch_floor: f64,
    pub pitch_ceiling: f64,
    pub voicing_threshold: f64,
    pub silence_threshold: f64,
    pub spectrogram_window: f64,
    pub spectrogram_hop: f64,
    pub spectrogram_max_frequency: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            time_step: 0.01,
            pitch_floor: 75.0,
            pitch_ceiling: 600.0,
            voicing_threshold: 0.45,
            silence_threshold: 0.03,
            spectrogram_window: 0.01,
            spectrogram_hop: 0.002,
            spectrogram_max_frequency: 5000.0,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        let positive = [
            self.time_step,
            self.pitch_floor,
            self.pitch_ceiling,
            self.spectrogram_window,
            self.spectrogram_hop,
            self.spectrogram_max_frequency,
        ];
        if positive.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigError::NonPositiveAnalysisParam);
        }
        if self.pitch_floor >= self.pitch_ceiling {
            return Err(ConfigError::PitchRange {
                floor: self.pitch_floor,
                ceiling: self.pitch_ceiling,
            });
        }
        if self.spectrogram_hop > self.spectrogram_window {
            return Err(ConfigError::HopExceedsWindow);
        }
        Ok(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognizerConfig {
    pub python: PathBuf,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl RecognizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from(DEFAULT_PYTHON),
            model: None,
            timeout_secs: DEFAULT_RECOGNIZER_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RendererConfig {
    pub binary: PathBuf,
    pub timeout_secs: u64,
}

impl RendererConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_ESPEAK_BINARY),
            timeout_secs: DEFAULT_RENDERER_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub language: LanguageCode,
    pub voice: VoiceId,
    pub analysis: AnalysisConfig,
    pub recognizer: RecognizerConfig,
    pub renderer: RendererConfig,
    /// Directory for transient audio files. `None` means the OS temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let language = LanguageCode::default();
        Self {
            language,
            voice: language.voice(),
            analysis: AnalysisConfig::default(),
            recognizer: RecognizerConfig::default(),
            renderer: RendererConfig::default(),
            scratch_dir: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown language code {0:?} (expected one of eng, cmn, jpn, spa, fra)")]
    UnknownLanguage(String),
    #[error("voice must not be empty")]
    EmptyVoice,
    #[error("timeout must be > 0 s")]
    ZeroTimeout,
    #[error("analysis time steps, windows and frequencies must be finite and > 0")]
    NonPositiveAnalysisParam,
    #[error("pitch floor {floor} Hz must be below pitch ceiling {ceiling} Hz")]
    PitchRange { floor: f64, ceiling: f64 },
    #[error("spectrogram hop must not exceed the window length")]
    HopExceedsWindow,
}

pub fn validate_timeout(secs: u64) -> Result<u64, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroTimeout);
    }
    Ok(secs)
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}

/// Explicit voice wins; otherwise the language's paired voice.
pub fn resolve_voice(
    cli_value: Option<String>,
    language: LanguageCode,
) -> Result<VoiceId, ConfigError> {
    match cli_value {
        Some(v) => VoiceId::new(v),
        None => Ok(language.voice()),
    }
}
