use crate::models::audio_models::AudioLevels;
use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingResult;
use crate::models::state::RecorderState;

/// Event delegate for recorder notifications.
///
/// Level updates and fault reports arrive on the persistence thread; state
/// changes arrive on whichever thread caused them. Implementations should
/// marshal to a UI thread if they need one.
pub trait RecorderDelegate: Send + Sync {
    /// Called after every state transition.
    fn on_state_changed(&self, state: RecorderState);

    /// Called at most once per level interval while streaming.
    fn on_levels_updated(&self, levels: &AudioLevels);

    /// Called when an error occurs, fatal or not.
    fn on_error(&self, error: &CaptureError);

    /// Called when a recording is finalized.
    fn on_recording_finished(&self, result: &RecordingResult);
}
