//! Short-time acoustic analysis: pitch, intensity and spectrogram.
//!
//! Every analysis here is total. Empty, silent or unvoiced input produces
//! well-defined floor values instead of errors or NaN, because reports always
//! show mean pitch, mean intensity and duration whatever the input quality.

mod intensity;
mod pitch;
mod spectrogram;

use crate::config::AnalysisConfig;
use crate::waveform::WaveformBuffer;
use serde::Serialize;

pub use intensity::{
    compute_intensity, IntensityContour, IntensityFrame, IntensitySettings, INTENSITY_FLOOR_DB,
};
pub use pitch::{compute_pitch, PitchContour, PitchFrame, PitchSettings};
pub use spectrogram::{compute_spectrogram, Spectrogram, SPECTROGRAM_POWER_FLOOR};

/// Every measurement the reports show for one signal.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcousticReport {
    pub duration: f64,
    pub mean_f0: f64,
    pub mean_intensity: f64,
    pub pitch: PitchContour,
    pub intensity: IntensityContour,
    pub spectrogram: Spectrogram,
}

#[derive(Clone, Debug, Default)]
pub struct AcousticAnalyzer {
    config: AnalysisConfig,
}

impl AcousticAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn pitch_settings(&self) -> PitchSettings {
        PitchSettings {
            time_step: self.config.time_step,
            floor: self.config.pitch_floor,
            ceiling: self.config.pitch_ceiling,
            voicing_threshold: self.config.voicing_threshold,
            silence_threshold: self.config.silence_threshold,
        }
    }

    pub fn intensity_settings(&self) -> IntensitySettings {
        IntensitySettings {
            time_step: self.config.time_step,
            pitch_floor: self.config.pitch_floor,
        }
    }

    pub fn compute_pitch(&self, buffer: &WaveformBuffer) -> PitchContour {
        compute_pitch(buffer, &self.pitch_settings())
    }

    pub fn compute_intensity(&self, buffer: &WaveformBuffer) -> IntensityContour {
        compute_intensity(buffer, &self.intensity_settings())
    }

    /// Spectrogram with the configured window and hop, converted to samples,
    /// cropped to `spectrogram_max_frequency`.
    pub fn compute_spectrogram(&self, buffer: &WaveformBuffer) -> Spectrogram {
        let sr = f64::from(buffer.sample_rate());
        let window = seconds_to_samples(self.config.spectrogram_window, sr);
        let hop = seconds_to_samples(self.config.spectrogram_hop, sr);
        compute_spectrogram(buffer, window, hop).band_limited(self.config.spectrogram_max_frequency)
    }

    pub fn analyze(&self, buffer: &WaveformBuffer) -> AcousticReport {
        let pitch = self.compute_pitch(buffer);
        let intensity = self.compute_intensity(buffer);
        let spectrogram = self.compute_spectrogram(buffer);
        tracing::debug!(
            frames = buffer.frames(),
            pitch_frames = pitch.len(),
            voiced = pitch.voiced_count(),
            spectrogram_rows = spectrogram.times().len(),
            "acoustic analysis finished"
        );
        AcousticReport {
            duration: buffer.duration(),
            mean_f0: pitch.mean_frequency(),
            mean_intensity: intensity.mean(),
            pitch,
            intensity,
            spectrogram,
        }
    }
}

fn seconds_to_samples(seconds: f64, sample_rate: f64) -> usize {
    let n = (seconds * sample_rate).round();
    if n.is_finite() && n >= 1.0 {
        n as usize
    } else {
        1
    }
}

/// Mono down-mix in f64.
fn mono_samples(buffer: &WaveformBuffer) -> Vec<f64> {
    buffer
        .to_mono()
        .samples()
        .iter()
        .map(|&s| f64::from(s))
        .collect()
}

fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = n as f64;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * (i as f64 + 0.5) / denom).cos())
        .collect()
}

/// Start offsets of full windows, `step` samples apart.
fn frame_starts(len: usize, window: usize, step: usize) -> impl Iterator<Item = usize> {
    let count = if window == 0 || len < window {
        0
    } else {
        (len - window) / step.max(1) + 1
    };
    (0..count).map(move |i| i * step.max(1))
}
