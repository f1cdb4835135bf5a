use super::{frame_starts, mono_samples};
use crate::waveform::WaveformBuffer;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::Serialize;

/// Every spectrogram cell is at least this; a silent input is all floor.
pub const SPECTROGRAM_POWER_FLOOR: f64 = 1e-20;

/// Power grid, row-major by time bin.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Spectrogram {
    times: Vec<f64>,
    frequencies: Vec<f64>,
    values: Vec<f64>,
}

impl Spectrogram {
    /// (time bins, frequency bins)
    pub fn dimensions(&self) -> (usize, usize) {
        (self.times.len(), self.frequencies.len())
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Power spectrum of one time bin.
    pub fn row(&self, time_bin: usize) -> Option<&[f64]> {
        let width = self.frequencies.len();
        let start = time_bin.checked_mul(width)?;
        self.values.get(start..start + width)
    }

    pub fn get(&self, time_bin: usize, frequency_bin: usize) -> Option<f64> {
        if frequency_bin >= self.frequencies.len() {
            return None;
        }
        self.row(time_bin).map(|r| r[frequency_bin])
    }

    /// Same grid in dB (10·log10), floored before the log.
    pub fn to_db(&self) -> Spectrogram {
        Spectrogram {
            times: self.times.clone(),
            frequencies: self.frequencies.clone(),
            values: self
                .values
                .iter()
                .map(|v| 10.0 * v.max(SPECTROGRAM_POWER_FLOOR).log10())
                .collect(),
        }
    }

    /// Drops frequency bins above `max_hz`.
    pub fn band_limited(&self, max_hz: f64) -> Spectrogram {
        let keep = self.frequencies.iter().take_while(|&&f| f <= max_hz).count();
        let width = self.frequencies.len();
        let values = if width == 0 {
            Vec::new()
        } else {
            self.values
                .chunks_exact(width)
                .flat_map(|row| row[..keep].iter().copied())
                .collect()
        };
        Spectrogram {
            times: self.times.clone(),
            frequencies: self.frequencies[..keep].to_vec(),
            values,
        }
    }
}

/// STFT power with a Gaussian window. Sizes are in samples and clamped to at least 1.
pub fn compute_spectrogram(buffer: &WaveformBuffer, window_size: usize, hop_size: usize) -> Spectrogram {
    let window_size = window_size.max(1);
    let hop_size = hop_size.max(1);
    let sr = f64::from(buffer.sample_rate());
    let x = mono_samples(buffer);

    let bins = window_size / 2 + 1;
    let frequencies: Vec<f64> = (0..bins)
        .map(|k| k as f64 * sr / window_size as f64)
        .collect();

    let window = gaussian(window_size);
    let energy: f64 = window.iter().map(|w| w * w).sum();
    let fft = FftPlanner::<f64>::new().plan_fft_forward(window_size);

    let mut times = Vec::new();
    let mut values = Vec::new();
    let mut buf = vec![Complex::new(0.0, 0.0); window_size];
    for start in frame_starts(x.len(), window_size, hop_size) {
        times.push((start as f64 + window_size as f64 / 2.0) / sr);
        for (slot, (s, w)) in buf
            .iter_mut()
            .zip(x[start..start + window_size].iter().zip(&window))
        {
            *slot = Complex::new(s * w, 0.0);
        }
        fft.process(&mut buf);
        values.extend(
            buf[..bins]
                .iter()
                .map(|c| (c.norm_sqr() / energy).max(SPECTROGRAM_POWER_FLOOR)),
        );
    }

    Spectrogram {
        times,
        frequencies,
        values,
    }
}

fn gaussian(n: usize) -> Vec<f64> {
    let len = n as f64;
    (0..n)
        .map(|i| {
            let u = (i as f64 + 0.5) / len - 0.5;
            (-12.0 * u * u).exp()
        })
        .collect()
}
