use crate::models::audio_models::{CaptureDiagnostics, RateNegotiation};
use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingResult;
use crate::models::state::RecorderState;
use crate::storage::container_writer::RecordingTarget;

/// Host integration boundary of a capture session.
///
/// Transitions: idle → monitoring → recording → idle, or monitoring → idle.
/// Anything else fails with [`CaptureError::InvalidStateTransition`].
pub trait RecorderControl: Send {
    fn state(&self) -> RecorderState;

    /// Configure the device clock. Idle only.
    fn negotiate_format(&mut self, requested_rate: u32) -> Result<RateNegotiation, CaptureError>;

    /// Rates the clock source advertises; empty if it does not say.
    fn supported_sample_rates(&mut self) -> Result<Vec<u32>, CaptureError>;

    /// Hardware-reported rate of the last successful negotiation.
    fn effective_sample_rate(&self) -> Option<u32>;

    /// Start streaming with `gain_db` applied. Transitions: idle → monitoring.
    fn start_monitoring(&mut self, gain_db: f32) -> Result<(), CaptureError>;

    /// Attach a writer to the running stream. Transitions: monitoring → recording.
    fn start_recording(&mut self, target: RecordingTarget) -> Result<(), CaptureError>;

    /// Close the recording and stop streaming. Transitions: recording → idle.
    fn stop_recording(&mut self) -> Result<RecordingResult, CaptureError>;

    /// Transitions: monitoring → idle.
    fn stop_monitoring(&mut self) -> Result<(), CaptureError>;

    /// Stop whatever is running. Returns the recording if one was open.
    fn stop(&mut self) -> Result<Option<RecordingResult>, CaptureError>;

    /// Returns the gain actually applied after clamping.
    fn set_gain_db(&self, gain_db: f32) -> Result<f32, CaptureError>;

    fn peak_level(&self) -> f32;

    fn has_clipped(&self) -> bool;

    fn reset_clip(&self);

    fn diagnostics(&self) -> CaptureDiagnostics;

    /// Result of the most recently finalized recording, including ones closed by a fault.
    fn last_recording(&self) -> Option<RecordingResult>;
}
