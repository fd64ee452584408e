use std::fmt;

use serde::{Deserialize, Serialize};

/// Recorder state machine.
///
/// State transitions:
/// ```text
/// idle ──start_monitoring──▶ monitoring ──start_recording──▶ recording
///  ▲                            │                               │
///  └────────stop_monitoring─────┘                               │
///  └──────────────────────stop_recording────────────────────────┘
/// ```
///
/// A device disconnect or a fatal streaming/storage error returns any state to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// No USB streaming.
    Idle,
    /// Streaming; gain, clip and peak are live, nothing reaches disk.
    Monitoring,
    /// Streaming and frames are appended to the container.
    Recording,
}

impl RecorderState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Monitoring | Self::Recording)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording)
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Monitoring => "monitoring",
            Self::Recording => "recording",
        };
        f.write_str(name)
    }
}
