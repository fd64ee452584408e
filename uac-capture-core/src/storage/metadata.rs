use std::fs;
use std::path::{Path, PathBuf};

use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingMetadata;

/// Sidecar location for a recording: `take.wav` → `take.metadata.json`.
pub fn sidecar_path(recording_path: &Path) -> PathBuf {
    recording_path.with_extension("metadata.json")
}

/// Write recording metadata as a JSON sidecar next to the recording.
pub fn write_metadata(metadata: &RecordingMetadata, recording_path: &Path) -> Result<PathBuf, CaptureError> {
    let metadata_path = sidecar_path(recording_path);
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| CaptureError::StorageError(format!("failed to serialize metadata: {}", e)))?;
    fs::write(&metadata_path, json)
        .map_err(|e| CaptureError::StorageError(format!("failed to write metadata: {}", e)))?;
    log::debug!("Wrote metadata sidecar {}", metadata_path.display());
    Ok(metadata_path)
}

/// Read recording metadata from its JSON sidecar.
pub fn read_metadata(recording_path: &Path) -> Result<RecordingMetadata, CaptureError> {
    let json = fs::read_to_string(sidecar_path(recording_path))
        .map_err(|e| CaptureError::StorageError(format!("failed to read metadata: {}", e)))?;
    serde_json::from_str(&json).map_err(|e| CaptureError::StorageError(format!("failed to parse metadata: {}", e)))
}
