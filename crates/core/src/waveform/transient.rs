use super::{DecodeError, WaveformBuffer};
use std::io::{self, Write};
use std::path::Path;
use tempfile::{Builder, NamedTempFile};

const PREFIX: &str = "linguaphon-";
const SUFFIX: &str = ".wav";

/// A WAV file on disk that exists exactly as long as this value.
///
/// The external recognizer and renderer exchange audio through file paths, so
/// flows materialize audio here. The file is removed when the value is dropped,
/// which also covers error returns and futures abandoned mid-flight.
#[derive(Debug)]
pub struct TransientAudioFile {
    file: NamedTempFile,
}

impl TransientAudioFile {
    /// Creates an empty file for an external process to write into.
    pub fn reserve_in(dir: &Path) -> io::Result<Self> {
        let file = Builder::new()
            .prefix(PREFIX)
            .suffix(SUFFIX)
            .tempfile_in(dir)?;
        Ok(Self { file })
    }

    pub fn from_bytes_in(dir: &Path, bytes: &[u8]) -> io::Result<Self> {
        let mut this = Self::reserve_in(dir)?;
        this.file.write_all(bytes)?;
        this.file.flush()?;
        Ok(this)
    }

    pub fn from_waveform_in(
        dir: &Path,
        buffer: &WaveformBuffer,
    ) -> Result<Self, DecodeError> {
        let this = Self::reserve_in(dir)?;
        buffer.write_wav(this.path())?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// True once something has written audio bytes to the file.
    pub fn is_populated(&self) -> bool {
        std::fs::metadata(self.path())
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    pub fn load(&self) -> Result<WaveformBuffer, DecodeError> {
        WaveformBuffer::load(self.path())
    }

    /// Deletes the file now, reporting failures that drop would swallow.
    pub fn close(self) -> io::Result<()> {
        self.file.close()
    }
}
