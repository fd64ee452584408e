use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::models::error::CaptureError;
use crate::processing::wav_format::{self, HeaderLayout, PcmFormat, SIZE_SENTINEL};

/// Anything a recording can be streamed into.
pub trait ContainerSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> ContainerSink for T {}

/// Payload written between `ds64` refreshes once a file is RF64.
pub const DS64_REFRESH_BYTES: u64 = 64 * 1024 * 1024;

/// Where a recording goes.
pub enum RecordingTarget {
    /// A file created (and truncated) by the writer. Parent directories are created.
    Path(PathBuf),
    /// An already-open, seekable handle supplied by the host.
    Handle(Box<dyn ContainerSink>),
}

impl RecordingTarget {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn handle<S: ContainerSink + 'static>(sink: S) -> Self {
        Self::Handle(Box::new(sink))
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Handle(_) => None,
        }
    }
}

impl fmt::Debug for RecordingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Handle(_) => f.write_str("Handle(..)"),
        }
    }
}

/// What `close` reports about a finished container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub file_path: Option<PathBuf>,
    pub format: PcmFormat,
    pub data_bytes: u64,
    pub frames: u64,
    pub rf64: bool,
    /// SHA-256 of the finished file; path targets only.
    pub checksum: Option<String>,
}

impl ContainerSummary {
    pub fn duration_secs(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / self.format.sample_rate as f64
    }
}

/// Streaming RIFF/WAVE writer that switches to RF64 in place.
///
/// The header is written up front with a `JUNK` reservation. Audio is appended
/// as it arrives and never buffered beyond the `BufWriter`. When the next
/// append would push the RIFF size past the 32-bit limit the header is
/// rewritten as RF64 before the append goes out. After that the `ds64` sizes
/// are rewritten every [`DS64_REFRESH_BYTES`] of payload, so a file cut off
/// mid-recording is a valid RF64 file that declares all audio except at most
/// the last refresh interval.
///
/// If the writer is dropped without [`close`](Self::close), sizes are patched
/// on a best-effort basis.
pub struct ContainerWriter {
    sink: Option<BufWriter<Box<dyn ContainerSink>>>,
    file_path: Option<PathBuf>,
    format: PcmFormat,
    layout: HeaderLayout,
    data_bytes: u64,
    legacy_limit: u64,
    rf64: bool,
    ds64_refresh: u64,
    /// `data_bytes` as last declared in `ds64`.
    ds64_synced_bytes: u64,
}

impl ContainerWriter {
    /// Create the target and write the initial header.
    pub fn open(target: RecordingTarget, format: PcmFormat) -> Result<Self, CaptureError> {
        Self::open_with_size_limit(target, format, u32::MAX as u64)
    }

    /// Like [`open`](Self::open) with a smaller RIFF size ceiling.
    pub(crate) fn open_with_size_limit(
        target: RecordingTarget,
        format: PcmFormat,
        legacy_limit: u64,
    ) -> Result<Self, CaptureError> {
        if format.block_align() == 0 || format.sample_rate == 0 {
            return Err(CaptureError::ContainerFormat(format!("invalid format: {:?}", format)));
        }

        let (sink, file_path): (Box<dyn ContainerSink>, Option<PathBuf>) = match target {
            RecordingTarget::Path(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .map_err(|e| CaptureError::StorageError(format!("failed to create directory: {}", e)))?;
                }
                let file = File::create(&path)
                    .map_err(|e| CaptureError::StorageError(format!("failed to create file: {}", e)))?;
                (Box::new(file), Some(path))
            }
            RecordingTarget::Handle(sink) => (sink, None),
        };

        let mut writer = Self {
            sink: Some(BufWriter::new(sink)),
            file_path,
            format,
            layout: HeaderLayout::for_format(&format),
            data_bytes: 0,
            legacy_limit,
            rf64: false,
            ds64_refresh: DS64_REFRESH_BYTES,
            ds64_synced_bytes: 0,
        };

        let header = wav_format::generate_header(&format);
        let sink = writer.sink_mut()?;
        sink.seek(SeekFrom::Start(0)).map_err(storage_error)?;
        sink.write_all(&header).map_err(storage_error)?;

        log::debug!(
            "Opened container {:?}: {} Hz, {} ch, {} bit",
            writer.file_path,
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        Ok(writer)
    }

    /// Append whole interleaved frames.
    pub fn append_frames(&mut self, frames: &[u8]) -> Result<(), CaptureError> {
        if frames.is_empty() {
            return Ok(());
        }
        let block_align = self.format.block_align() as usize;
        if frames.len() % block_align != 0 {
            return Err(CaptureError::ContainerFormat(format!(
                "{} bytes is not a whole number of {}-byte frames",
                frames.len(),
                block_align
            )));
        }

        if !self.rf64 && self.riff_size_with(frames.len() as u64) > self.legacy_limit {
            self.promote()?;
        }

        self.sink_mut()?.write_all(frames).map_err(storage_error)?;
        self.data_bytes += frames.len() as u64;

        if self.rf64 && self.data_bytes - self.ds64_synced_bytes >= self.ds64_refresh {
            self.refresh_ds64()?;
        }
        Ok(())
    }

    /// Patch the final sizes, flush and release the target.
    pub fn close(mut self) -> Result<ContainerSummary, CaptureError> {
        self.finalize()?;

        let checksum = match &self.file_path {
            Some(path) => Some(sha256_file(path)?),
            None => None,
        };

        log::info!(
            "Closed container {:?}: {} bytes of audio ({})",
            self.file_path,
            self.data_bytes,
            if self.rf64 { "RF64" } else { "RIFF" }
        );

        Ok(ContainerSummary {
            file_path: self.file_path.clone(),
            format: self.format,
            data_bytes: self.data_bytes,
            frames: self.frames(),
            rf64: self.rf64,
            checksum,
        })
    }

    /// Best-effort header patch after a failure, without checksumming.
    ///
    /// Returns how many payload bytes the file declares.
    pub fn abandon(mut self) -> u64 {
        if let Err(e) = self.finalize() {
            log::error!("Failed to patch headers of {:?}: {}", self.file_path, e);
            self.sink = None;
        }
        log::warn!(
            "Abandoned container {:?} after {} bytes of audio",
            self.file_path,
            self.data_bytes
        );
        self.data_bytes
    }

    #[cfg(test)]
    pub(crate) fn set_ds64_refresh(&mut self, bytes: u64) {
        self.ds64_refresh = bytes.max(1);
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn frames(&self) -> u64 {
        self.data_bytes / self.format.block_align() as u64
    }

    pub fn is_rf64(&self) -> bool {
        self.rf64
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn riff_size_with(&self, extra: u64) -> u64 {
        self.layout.header_len() - 8 + self.data_bytes + extra
    }

    fn promote(&mut self) -> Result<(), CaptureError> {
        let riff_size = self.riff_size_with(0);
        let ds64 = wav_format::ds64_chunk(riff_size, self.data_bytes, self.frames());
        let data_size_offset = self.layout.data_size_offset();
        let resume_at = self.layout.header_len() + self.data_bytes;

        let sink = self.sink_mut()?;
        sink.seek(SeekFrom::Start(0)).map_err(storage_error)?;
        sink.write_all(b"RF64").map_err(storage_error)?;
        sink.write_all(&SIZE_SENTINEL.to_le_bytes()).map_err(storage_error)?;
        sink.seek(SeekFrom::Start(wav_format::DS64_OFFSET)).map_err(storage_error)?;
        sink.write_all(&ds64).map_err(storage_error)?;
        sink.seek(SeekFrom::Start(data_size_offset)).map_err(storage_error)?;
        sink.write_all(&SIZE_SENTINEL.to_le_bytes()).map_err(storage_error)?;
        sink.seek(SeekFrom::Start(resume_at)).map_err(storage_error)?;
        sink.flush().map_err(storage_error)?;

        self.rf64 = true;
        self.ds64_synced_bytes = self.data_bytes;
        log::info!("Container {:?} exceeded 4 GiB, promoted to RF64", self.file_path);
        Ok(())
    }

    /// Declare everything written so far in `ds64`, then resume at the end of the payload.
    fn refresh_ds64(&mut self) -> Result<(), CaptureError> {
        let ds64 = wav_format::ds64_chunk(self.riff_size_with(0), self.data_bytes, self.frames());
        let resume_at = self.layout.header_len() + self.data_bytes;

        let sink = self.sink_mut()?;
        sink.seek(SeekFrom::Start(wav_format::DS64_OFFSET)).map_err(storage_error)?;
        sink.write_all(&ds64).map_err(storage_error)?;
        sink.seek(SeekFrom::Start(resume_at)).map_err(storage_error)?;
        sink.flush().map_err(storage_error)?;

        self.ds64_synced_bytes = self.data_bytes;
        log::debug!("Refreshed ds64 of {:?} at {} bytes", self.file_path, self.data_bytes);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), CaptureError> {
        let pad = self.data_bytes % 2;
        if !self.rf64 && self.riff_size_with(pad) > self.legacy_limit {
            self.promote()?;
        }

        let riff_size = self.riff_size_with(pad);
        let data_bytes = self.data_bytes;
        let frames = self.frames();
        let rf64 = self.rf64;
        let end_of_data = self.layout.header_len() + data_bytes;
        let data_size_offset = self.layout.data_size_offset();
        let riff_size_offset = self.layout.riff_size_offset();

        let sink = self.sink_mut()?;
        if pad == 1 {
            sink.seek(SeekFrom::Start(end_of_data)).map_err(storage_error)?;
            sink.write_all(&[0]).map_err(storage_error)?;
        }
        if rf64 {
            let ds64 = wav_format::ds64_chunk(riff_size, data_bytes, frames);
            sink.seek(SeekFrom::Start(wav_format::DS64_OFFSET)).map_err(storage_error)?;
            sink.write_all(&ds64).map_err(storage_error)?;
        } else {
            sink.seek(SeekFrom::Start(riff_size_offset)).map_err(storage_error)?;
            sink.write_all(&(riff_size as u32).to_le_bytes()).map_err(storage_error)?;
            sink.seek(SeekFrom::Start(data_size_offset)).map_err(storage_error)?;
            sink.write_all(&(data_bytes as u32).to_le_bytes()).map_err(storage_error)?;
        }
        sink.flush().map_err(storage_error)?;

        // Dropping the BufWriter closes a path target's file
        self.sink = None;
        Ok(())
    }

    fn sink_mut(&mut self) -> Result<&mut BufWriter<Box<dyn ContainerSink>>, CaptureError> {
        self.sink
            .as_mut()
            .ok_or_else(|| CaptureError::StorageError("container is closed".into()))
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if self.sink.is_some() {
            log::warn!("Container {:?} dropped without close, patching headers", self.file_path);
            if let Err(e) = self.finalize() {
                log::error!("Failed to finalize abandoned container: {}", e);
            }
        }
    }
}

impl fmt::Debug for ContainerWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerWriter")
            .field("file_path", &self.file_path)
            .field("format", &self.format)
            .field("data_bytes", &self.data_bytes)
            .field("rf64", &self.rf64)
            .field("open", &self.sink.is_some())
            .finish()
    }
}

/// Compute SHA-256 hex digest of a file without loading it into memory.
fn sha256_file(path: &Path) -> Result<String, CaptureError> {
    let mut file =
        File::open(path).map_err(|e| CaptureError::StorageError(format!("failed to open file for checksum: {}", e)))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| CaptureError::StorageError(format!("failed to read file for checksum: {}", e)))?;
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn storage_error(e: io::Error) -> CaptureError {
    CaptureError::StorageError(format!("write failed: {}", e))
}
