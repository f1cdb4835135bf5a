use super::{frame_starts, hann, mono_samples};
use crate::waveform::WaveformBuffer;
use serde::Serialize;

/// Lowest reported intensity. Silence and empty input land here.
pub const INTENSITY_FLOOR_DB: f64 = -100.0;
/// Reference pressure; samples are treated as pascals.
const REFERENCE_PRESSURE: f64 = 2e-5;
/// Window length in periods of the pitch floor, so voicing periodicity averages out.
const PERIODS_PER_WINDOW: f64 = 3.2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensitySettings {
    pub time_step: f64,
    pub pitch_floor: f64,
}

impl Default for IntensitySettings {
    fn default() -> Self {
        Self {
            time_step: 0.01,
            pitch_floor: 75.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IntensityFrame {
    pub time: f64,
    pub db: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IntensityContour {
    mean_db: f64,
    frames: Vec<IntensityFrame>,
}

impl IntensityContour {
    fn from_frames(frames: Vec<IntensityFrame>) -> Self {
        let mean_db = if frames.is_empty() {
            INTENSITY_FLOOR_DB
        } else {
            frames.iter().map(|f| f.db).sum::<f64>() / frames.len() as f64
        };
        Self { mean_db, frames }
    }

    /// Arithmetic mean of the per-frame dB values.
    pub fn mean(&self) -> f64 {
        self.mean_db
    }

    pub fn frames(&self) -> &[IntensityFrame] {
        &self.frames
    }
}

impl Default for IntensityContour {
    fn default() -> Self {
        Self::from_frames(Vec::new())
    }
}

pub fn compute_intensity(buffer: &WaveformBuffer, settings: &IntensitySettings) -> IntensityContour {
    let x = mono_samples(buffer);
    if x.is_empty() {
        return IntensityContour::default();
    }
    let sr = f64::from(buffer.sample_rate());
    let pitch_floor = if settings.pitch_floor.is_finite() && settings.pitch_floor > 0.0 {
        settings.pitch_floor
    } else {
        IntensitySettings::default().pitch_floor
    };
    let time_step = if settings.time_step.is_finite() && settings.time_step > 0.0 {
        settings.time_step
    } else {
        0.8 / pitch_floor
    };
    let window_len = ((PERIODS_PER_WINDOW / pitch_floor * sr).round() as usize).max(1);
    let step = ((time_step * sr).round() as usize).max(1);

    if x.len() < window_len {
        // Too short for a full window: one frame over everything there is.
        let frame = IntensityFrame {
            time: buffer.duration() / 2.0,
            db: frame_db(&x, &hann(x.len())),
        };
        return IntensityContour::from_frames(vec![frame]);
    }

    let window = hann(window_len);
    let frames = frame_starts(x.len(), window_len, step)
        .map(|start| IntensityFrame {
            time: (start as f64 + window_len as f64 / 2.0) / sr,
            db: frame_db(&x[start..start + window_len], &window),
        })
        .collect();
    IntensityContour::from_frames(frames)
}

fn frame_db(frame: &[f64], window: &[f64]) -> f64 {
    let weight: f64 = window.iter().sum();
    if weight <= 0.0 {
        return INTENSITY_FLOOR_DB;
    }
    let mean = frame.iter().zip(window).map(|(s, w)| s * w).sum::<f64>() / weight;
    let power = frame
        .iter()
        .zip(window)
        .map(|(s, w)| w * (s - mean) * (s - mean))
        .sum::<f64>()
        / weight;
    if !(power.is_finite() && power > 0.0) {
        return INTENSITY_FLOOR_DB;
    }
    (10.0 * (power / (REFERENCE_PRESSURE * REFERENCE_PRESSURE)).log10()).max(INTENSITY_FLOOR_DB)
}
