use thiserror::Error;

use super::state::RecorderState;

/// Errors that can occur during capture operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("device rejected request: {0}")]
    DeviceRejected(String),

    #[error("device unresponsive: {0}")]
    DeviceUnresponsive(String),

    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("device not available")]
    DeviceNotAvailable,

    /// The host cannot accept even one full device packet per transfer.
    #[error("packet size {packet_size} exceeds host transfer ceiling {transfer_ceiling}")]
    PacketSizeUnsatisfiable {
        packet_size: usize,
        transfer_ceiling: usize,
    },

    #[error("isochronous transfer queue ran dry")]
    TransferStarvation,

    #[error("cannot {operation} while {from}")]
    InvalidStateTransition {
        from: RecorderState,
        operation: &'static str,
    },

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("malformed container: {0}")]
    ContainerFormat(String),
}

impl CaptureError {
    /// Whether this error ends the current streaming run.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::DeviceDisconnected
                | Self::TransferStarvation
                | Self::StorageError(_)
                | Self::PacketSizeUnsatisfiable { .. }
        )
    }
}

/// Failures reported by a USB transport implementation.
///
/// Backends map their native errors onto this; the protocol controller and
/// transfer engine translate it into [`CaptureError`] with context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map a control-transfer failure during `step`.
    pub fn into_control_error(self, step: &str) -> CaptureError {
        match self {
            Self::Timeout => CaptureError::DeviceUnresponsive(format!("{step}: timed out")),
            Self::Stall => CaptureError::DeviceUnresponsive(format!("{step}: protocol stall")),
            Self::Disconnected => CaptureError::DeviceDisconnected,
            Self::Other(msg) => CaptureError::DeviceRejected(format!("{step}: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_map_to_taxonomy() {
        assert!(matches!(
            TransportError::Timeout.into_control_error("GET_CUR"),
            CaptureError::DeviceUnresponsive(_)
        ));
        assert!(matches!(
            TransportError::Stall.into_control_error("SET_CUR"),
            CaptureError::DeviceUnresponsive(_)
        ));
        assert_eq!(
            TransportError::Disconnected.into_control_error("SET_CUR"),
            CaptureError::DeviceDisconnected
        );
        assert!(matches!(
            TransportError::Other("access denied".into()).into_control_error("alt 0"),
            CaptureError::DeviceRejected(_)
        ));
    }

    #[test]
    fn invalid_transition_message_names_state() {
        let err = CaptureError::InvalidStateTransition {
            from: RecorderState::Idle,
            operation: "start recording",
        };
        assert_eq!(err.to_string(), "cannot start recording while idle");
    }
}
