//! Delegate that reports session events on the terminal.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use uac_capture_core::{AudioLevels, CaptureError, RecorderDelegate, RecorderState, RecordingResult};

/// Logs state changes and errors, draws a level meter on stderr.
pub struct ConsoleDelegate {
    last_error: Mutex<Option<CaptureError>>,
}

impl ConsoleDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_error: Mutex::new(None),
        })
    }

    pub fn has_error(&self) -> bool {
        self.last_error.lock().is_some()
    }

    /// Error that ended the stream, if any.
    pub fn take_error(&self) -> Option<CaptureError> {
        self.last_error.lock().take()
    }
}

impl RecorderDelegate for ConsoleDelegate {
    fn on_state_changed(&self, state: RecorderState) {
        log::info!("session {}", state);
    }

    fn on_levels_updated(&self, levels: &AudioLevels) {
        eprint!("\r{}", meter(levels));
        let _ = std::io::stderr().flush();
    }

    fn on_error(&self, error: &CaptureError) {
        eprintln!();
        log::error!("capture error: {}", error);
        *self.last_error.lock() = Some(error.clone());
    }

    fn on_recording_finished(&self, result: &RecordingResult) {
        eprintln!();
        log::info!(
            "recording finished: {:.2}s, {} frames",
            result.duration_secs,
            result.metadata.frames
        );
    }
}

const METER_WIDTH: usize = 40;

/// One-line peak meter, dBFS scaled over 60 dB.
pub fn meter(levels: &AudioLevels) -> String {
    let db = if levels.peak > 0.0 {
        20.0 * levels.peak.log10()
    } else {
        f32::NEG_INFINITY
    };
    let filled = (((db + 60.0) / 60.0).clamp(0.0, 1.0) * METER_WIDTH as f32).round() as usize;
    format!(
        "[{}{}] {:>6} dBFS{}",
        "#".repeat(filled),
        " ".repeat(METER_WIDTH - filled),
        if db.is_finite() { format!("{db:.1}") } else { "-inf".to_string() },
        if levels.clipped { " CLIP" } else { "" }
    )
}
