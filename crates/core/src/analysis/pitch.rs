use super::{frame_starts, hann, mono_samples};
use crate::waveform::WaveformBuffer;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::Serialize;

/// Analysis window length in periods of the pitch floor.
const PERIODS_PER_WINDOW: f64 = 3.0;
/// A shorter-lag peak within this fraction of the best peak wins (octave guard).
const OCTAVE_JUMP_RATIO: f64 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PitchSettings {
    /// Seconds between frame centers.
    pub time_step: f64,
    pub floor: f64,
    pub ceiling: f64,
    /// Minimum normalized autocorrelation peak for a voiced frame.
    pub voicing_threshold: f64,
    /// Frames whose peak amplitude is below this fraction of the global peak are unvoiced.
    pub silence_threshold: f64,
}

impl Default for PitchSettings {
    fn default() -> Self {
        Self {
            time_step: 0.01,
            floor: 75.0,
            ceiling: 600.0,
            voicing_threshold: 0.45,
            silence_threshold: 0.03,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PitchFrame {
    /// Frame center, seconds.
    pub time: f64,
    /// `None` for unvoiced frames.
    pub frequency: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PitchContour {
    frames: Vec<PitchFrame>,
}

impl PitchContour {
    pub fn frames(&self) -> &[PitchFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn voiced(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.frames
            .iter()
            .filter_map(|f| f.frequency.map(|hz| (f.time, hz)))
    }

    pub fn voiced_count(&self) -> usize {
        self.voiced().count()
    }

    /// Mean F0 over voiced frames, 0.0 when nothing is voiced.
    pub fn mean_frequency(&self) -> f64 {
        let (sum, n) = self
            .voiced()
            .fold((0.0, 0usize), |(sum, n), (_, hz)| (sum + hz, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

/// Autocorrelation pitch tracker restricted to `[floor, ceiling]`.
pub fn compute_pitch(buffer: &WaveformBuffer, settings: &PitchSettings) -> PitchContour {
    let x = mono_samples(buffer);
    let sr = f64::from(buffer.sample_rate());
    let floor = sanitize(settings.floor, PitchSettings::default().floor);
    let ceiling = sanitize(settings.ceiling, PitchSettings::default().ceiling).max(floor * 1.5);
    let time_step = sanitize(settings.time_step, 0.75 / floor);

    let window_len = (PERIODS_PER_WINDOW / floor * sr).round() as usize;
    if window_len < 4 || x.len() < window_len {
        return PitchContour::default();
    }
    let step = ((time_step * sr).round() as usize).max(1);

    let min_lag = ((sr / ceiling).floor() as usize).max(2);
    let max_lag = ((sr / floor).ceil() as usize).min(window_len - 2);

    let global_peak = x.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    let tracker = FrameTracker::new(window_len, min_lag, max_lag);

    let frames = frame_starts(x.len(), window_len, step)
        .map(|start| {
            let time = (start as f64 + window_len as f64 / 2.0) / sr;
            let frame = &x[start..start + window_len];
            let frequency = if min_lag >= max_lag || global_peak <= 0.0 {
                None
            } else {
                tracker.estimate(frame, global_peak, sr, settings)
            };
            PitchFrame { time, frequency }
        })
        .collect();

    PitchContour { frames }
}

fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

struct FrameTracker {
    window: Vec<f64>,
    /// Normalized autocorrelation of the window itself, indexed by lag.
    window_ac: Vec<f64>,
    fft_len: usize,
    forward: std::sync::Arc<dyn rustfft::Fft<f64>>,
    inverse: std::sync::Arc<dyn rustfft::Fft<f64>>,
    min_lag: usize,
    max_lag: usize,
}

impl FrameTracker {
    fn new(window_len: usize, min_lag: usize, max_lag: usize) -> Self {
        let fft_len = (window_len * 2).next_power_of_two();
        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let mut tracker = Self {
            window: hann(window_len),
            window_ac: Vec::new(),
            fft_len,
            forward,
            inverse,
            min_lag,
            max_lag,
        };
        let raw = tracker.autocorrelation(&tracker.window);
        let r0 = raw[0];
        tracker.window_ac = raw.iter().map(|r| r / r0).collect();
        tracker
    }

    /// Linear autocorrelation for lags `0..signal.len()`.
    fn autocorrelation(&self, signal: &[f64]) -> Vec<f64> {
        let mut buf: Vec<Complex<f64>> = signal
            .iter()
            .map(|&s| Complex::new(s, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
            .take(self.fft_len)
            .collect();
        self.forward.process(&mut buf);
        for c in buf.iter_mut() {
            *c = Complex::new(c.norm_sqr(), 0.0);
        }
        self.inverse.process(&mut buf);
        let scale = 1.0 / self.fft_len as f64;
        buf.iter()
            .take(signal.len())
            .map(|c| c.re * scale)
            .collect()
    }

    fn estimate(
        &self,
        frame: &[f64],
        global_peak: f64,
        sr: f64,
        settings: &PitchSettings,
    ) -> Option<f64> {
        let mean = frame.iter().sum::<f64>() / frame.len() as f64;
        let local_peak = frame.iter().fold(0.0f64, |m, s| m.max((s - mean).abs()));
        if local_peak < settings.silence_threshold * global_peak {
            return None;
        }

        let weighted: Vec<f64> = frame
            .iter()
            .zip(&self.window)
            .map(|(s, w)| (s - mean) * w)
            .collect();
        let r = self.autocorrelation(&weighted);
        if r[0] <= 0.0 {
            return None;
        }

        // Normalized correlation over the search range plus one guard lag per side.
        let lo = self.min_lag - 1;
        let hi = self.max_lag + 1;
        let nr: Vec<f64> = (lo..=hi)
            .map(|lag| {
                let w = self.window_ac[lag];
                if w > 0.0 {
                    r[lag] / r[0] / w
                } else {
                    0.0
                }
            })
            .collect();
        let at = |lag: usize| nr[lag - lo];

        let best = (self.min_lag..=self.max_lag)
            .map(at)
            .fold(f64::NEG_INFINITY, f64::max);
        if best <= settings.voicing_threshold {
            return None;
        }

        // A maximum sitting on the edge of the search range is not a period.
        let is_peak = |lag: usize| at(lag) >= at(lag - 1) && at(lag) >= at(lag + 1);
        let lag = (self.min_lag..=self.max_lag)
            .find(|&lag| is_peak(lag) && at(lag) >= OCTAVE_JUMP_RATIO * best)?;

        let (y0, y1, y2) = (at(lag - 1), at(lag), at(lag + 1));
        let denom = y0 - 2.0 * y1 + y2;
        let (offset, strength) = if denom < 0.0 {
            let d = (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
            (d, y1 - 0.25 * (y0 - y2) * d)
        } else {
            (0.0, y1)
        };
        if strength <= settings.voicing_threshold {
            return None;
        }

        let hz = sr / (lag as f64 + offset);
        hz.is_finite().then_some(hz)
    }
}
