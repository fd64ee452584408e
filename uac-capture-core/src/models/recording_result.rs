use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::audio_models::{CaptureDiagnostics, DeviceFormat};

/// Result returned when a recording is finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    /// `None` when the host supplied an already-open handle.
    pub file_path: Option<PathBuf>,
    pub duration_secs: f64,
    pub metadata: RecordingMetadata,
    /// SHA-256 of the finished file; only computed for path targets.
    pub checksum: Option<String>,
}

/// Metadata stored alongside a recording.
///
/// Serializable for the JSON sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: String,
    pub created_at: String,
    pub duration_secs: f64,
    pub file_path: Option<String>,
    pub checksum: Option<String>,
    pub sample_rate: u32,
    pub requested_sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub frames: u64,
    pub data_bytes: u64,
    /// Whether the container was promoted to RF64.
    pub rf64: bool,
    pub diagnostics: CaptureDiagnostics,
}

impl RecordingMetadata {
    pub fn new(
        format: &DeviceFormat,
        frames: u64,
        data_bytes: u64,
        rf64: bool,
        file_path: Option<&str>,
        checksum: Option<&str>,
        diagnostics: CaptureDiagnostics,
    ) -> Self {
        let duration_secs = if format.effective_rate > 0 {
            frames as f64 / format.effective_rate as f64
        } else {
            0.0
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            duration_secs,
            file_path: file_path.map(str::to_string),
            checksum: checksum.map(str::to_string),
            sample_rate: format.effective_rate,
            requested_sample_rate: format.requested_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
            frames,
            data_bytes,
            rf64,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_uses_effective_rate() {
        let format = DeviceFormat {
            requested_rate: 96000,
            effective_rate: 48000,
            channels: 2,
            bit_depth: 16,
            max_packet_size: 192,
        };
        let meta = RecordingMetadata::new(&format, 96000, 384_000, false, None, None, CaptureDiagnostics::default());
        assert!((meta.duration_secs - 2.0).abs() < 1e-9);
        assert_eq!(meta.requested_sample_rate, 96000);
        assert_eq!(meta.sample_rate, 48000);
        assert!(!meta.id.is_empty());
    }
}
