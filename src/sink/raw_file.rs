//! Raw PCM file sink with a bounded staging area

use crate::error::SinkError;
use crate::sink::DataSink;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size of the in-memory staging area in bytes (ten capture blocks)
pub const RECORD_BUFFER_SIZE: usize = 327_680;

/// Output path used when none is configured
pub const DEFAULT_OUTPUT_PATH: &str = "test.raw";

/// Contiguous byte region with a write cursor
///
/// Invariant: `0 <= len() <= capacity()`.
pub struct StagingBuffer {
    data: Box<[u8]>,
    cursor: usize,
}

impl StagingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently staged
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Whether `count` more bytes fit without overflowing
    pub fn fits(&self, count: usize) -> bool {
        self.cursor + count <= self.data.len()
    }

    /// Copy `chunk` in; returns false (and stages nothing) if it does not fit
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if !self.fits(chunk.len()) {
            return false;
        }
        self.data[self.cursor..self.cursor + chunk.len()].copy_from_slice(chunk);
        self.cursor += chunk.len();
        true
    }

    /// The staged prefix `[0, cursor)`
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.cursor]
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
    }
}

/// Writes raw little-endian PCM to a file, staging writes in memory
///
/// No header is written; the consumer must learn the format separately
/// (see [`crate::sink::wrap_raw_as_wav`]).
pub struct RawFileSink {
    path: PathBuf,
    file: Option<File>,
    staging: StagingBuffer,
    bytes_received: u64,
    bytes_written: u64,
    peak_staged: usize,
    flushes: usize,
}

impl RawFileSink {
    /// Create (or truncate) the output file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        Self::with_staging_capacity(path, RECORD_BUFFER_SIZE)
    }

    /// Create with a custom staging area size
    pub fn with_staging_capacity<P: AsRef<Path>>(
        path: P,
        capacity: usize,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| SinkError::WriteFailed {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!("Raw sink writing to {}", path.display());

        Ok(Self {
            path,
            file: Some(file),
            staging: StagingBuffer::new(capacity),
            bytes_received: 0,
            bytes_written: 0,
            peak_staged: 0,
            flushes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes handed to the sink
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Total bytes written to the file so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Largest amount ever held in the staging area
    pub fn peak_staged(&self) -> usize {
        self.peak_staged
    }

    /// Number of staging flushes performed
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn staged(&self) -> usize {
        self.staging.len()
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn write_through(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        file.write_all(data).map_err(|e| SinkError::WriteFailed {
            path: self.path.display().to_string(),
            source: e,
        })?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Write the staged prefix to the file and reset the cursor
    fn flush_staging(&mut self) -> Result<(), SinkError> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        let staged = self.staging.contents();
        file.write_all(staged).map_err(|e| SinkError::WriteFailed {
            path: self.path.display().to_string(),
            source: e,
        })?;

        self.bytes_written += staged.len() as u64;
        self.flushes += 1;
        debug!("Flushed {} staged bytes", staged.len());
        self.staging.clear();
        Ok(())
    }
}

impl DataSink for RawFileSink {
    fn on_new_data(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if self.file.is_none() {
            return Err(SinkError::Closed);
        }
        self.bytes_received += data.len() as u64;

        if !self.staging.fits(data.len()) {
            self.flush_staging()?;
        }

        // Chunks bigger than the whole staging area bypass it
        if !self.staging.push(data) {
            return self.write_through(data);
        }

        self.peak_staged = self.peak_staged.max(self.staging.len());
        Ok(())
    }

    fn on_stopped(&mut self) -> Result<(), SinkError> {
        if self.file.is_none() {
            return Ok(());
        }

        self.flush_staging()?;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        info!(
            "Wrote {} bytes to {}",
            self.bytes_written,
            self.path.display()
        );
        Ok(())
    }
}

impl Drop for RawFileSink {
    fn drop(&mut self) {
        let _ = self.on_stopped();
    }
}
