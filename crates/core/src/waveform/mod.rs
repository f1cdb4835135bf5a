mod transient;

use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub use transient::TransientAudioFile;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("failed to read audio: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported or malformed audio container: {0}")]
    Container(String),

    #[error("no decodable audio track")]
    NoAudioTrack,

    #[error("invalid pcm layout: {0}")]
    InvalidPcm(String),

    #[error("failed to write wav: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Decoded audio signal. Samples are interleaved by channel.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl WaveformBuffer {
    pub fn from_samples(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(DecodeError::InvalidPcm("sample rate must be > 0".to_owned()));
        }
        if channels == 0 {
            return Err(DecodeError::InvalidPcm("channel count must be > 0".to_owned()));
        }
        if !samples.len().is_multiple_of(usize::from(channels)) {
            return Err(DecodeError::InvalidPcm(format!(
                "{} samples do not split into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Decodes a WAV file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        decode(Box::new(file), hint)
    }

    pub fn from_wav_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let mut hint = Hint::new();
        hint.with_extension("wav");
        decode(Box::new(Cursor::new(bytes.into())), hint)
    }

    /// Writes the buffer as 16-bit PCM WAV.
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path.as_ref(), spec)
            .map_err(|e| DecodeError::Encode(e.to_string()))?;
        for &s in &self.samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
            writer
                .write_sample(v)
                .map_err(|e| DecodeError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| DecodeError::Encode(e.to_string()))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Channel average as a new single-channel buffer.
    pub fn to_mono(&self) -> WaveformBuffer {
        if self.channels == 1 {
            return self.clone();
        }
        let n = usize::from(self.channels);
        let scale = 1.0 / n as f32;
        let samples = self
            .samples
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect();
        WaveformBuffer {
            samples,
            channels: 1,
            sample_rate: self.sample_rate,
        }
    }
}

fn decode(source: Box<dyn MediaSource>, hint: Hint) -> Result<WaveformBuffer> {
    let mss = MediaSourceStream::new(source, Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(container_err)?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(container_err)?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(container_err(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = decoder.decode(&packet).map_err(container_err)?;
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    WaveformBuffer::from_samples(samples, channels, sample_rate)
}

fn container_err(e: SymphoniaError) -> DecodeError {
    match e {
        SymphoniaError::IoError(io) => DecodeError::Io(io),
        other => DecodeError::Container(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 / n as f32) - 0.5).collect()
    }

    #[test]
    fn duration_is_frames_over_rate() {
        let buf = WaveformBuffer::from_samples(vec![0.0; 32_000], 2, 16_000).expect("valid");
        assert_eq!(buf.total_samples(), 32_000);
        assert_eq!(buf.frames(), 16_000);
        assert!((buf.duration() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_buffer_has_zero_duration() {
        let buf = WaveformBuffer::from_samples(Vec::new(), 1, 16_000).expect("valid");
        assert!(buf.is_empty());
        assert_eq!(buf.duration(), 0.0);
    }

    #[test]
    fn rejects_ragged_interleaving() {
        let err = WaveformBuffer::from_samples(vec![0.0; 3], 2, 16_000).unwrap_err();
        assert!(err.to_string().contains("2 channels"));
        assert!(WaveformBuffer::from_samples(vec![0.0; 4], 1, 0).is_err());
        assert!(WaveformBuffer::from_samples(vec![0.0; 4], 0, 8_000).is_err());
    }

    #[test]
    fn to_mono_averages_channels() {
        let buf = WaveformBuffer::from_samples(vec![1.0, 0.0, 0.5, -0.5], 2, 8_000).expect("valid");
        let mono = buf.to_mono();
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.samples(), &[0.5, 0.0]);
        assert_eq!(buf.channels(), 2);
    }

    #[test]
    fn wav_roundtrip_preserves_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ramp.wav");
        let original = WaveformBuffer::from_samples(ramp(2_000), 2, 22_050).expect("valid");
        original.write_wav(&path).expect("write");

        let loaded = WaveformBuffer::load(&path).expect("load");
        assert_eq!(loaded.channels(), 2);
        assert_eq!(loaded.sample_rate(), 22_050);
        assert_eq!(loaded.total_samples(), 2_000);
        for (a, b) in loaded.samples().iter().zip(original.samples()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn from_wav_bytes_matches_file_decoding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        let original = WaveformBuffer::from_samples(ramp(800), 1, 8_000).expect("valid");
        original.write_wav(&path).expect("write");

        let bytes = std::fs::read(&path).expect("read");
        let from_bytes = WaveformBuffer::from_wav_bytes(bytes).expect("decode");
        let from_file = WaveformBuffer::load(&path).expect("load");
        assert_eq!(from_bytes, from_file);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = WaveformBuffer::from_wav_bytes(b"definitely not a riff container".to_vec())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Container(_) | DecodeError::Io(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = WaveformBuffer::load("/nonexistent/linguaphon/input.wav").unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }
}
