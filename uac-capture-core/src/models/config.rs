use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default host ceiling on bytes per isochronous transfer request.
///
/// Observed on the original capture hardware's host stack; it is not a
/// documented constant. Backends report their own value and configuration can
/// override both.
pub const DEFAULT_TRANSFER_CEILING: usize = 23552;

/// USB addressing of the audio function's control and streaming interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingInterface {
    /// AudioControl interface number (low byte of `wIndex` for clock requests).
    pub control_interface: u8,
    /// AudioStreaming interface carrying the isochronous IN endpoint.
    pub streaming_interface: u8,
    /// Alternate setting that enables the endpoint (0 disables it).
    pub streaming_alt_setting: u8,
    /// Clock Source entity id (high byte of `wIndex`).
    pub clock_source_id: u8,
    /// Isochronous IN endpoint address, direction bit included.
    pub endpoint_address: u8,
}

impl Default for StreamingInterface {
    fn default() -> Self {
        Self {
            control_interface: 0,
            streaming_interface: 1,
            streaming_alt_setting: 1,
            clock_source_id: 0x29,
            endpoint_address: 0x81,
        }
    }
}

/// Configuration for a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// Requested sample rate in Hz (default: 48000).
    pub sample_rate: u32,

    /// Fixed channel count of the device's streaming format.
    pub channels: u16,

    /// Fixed bits per sample container. Valid values: 16, 24, 32.
    pub bit_depth: u16,

    pub interface: StreamingInterface,

    /// Host transfer-size ceiling override; `None` uses the transport's report.
    pub transfer_ceiling: Option<usize>,

    /// Upper bound on isochronous packets per transfer (default: 8).
    pub max_packets_per_transfer: usize,

    /// Descriptors kept in flight (default: 8, minimum 2).
    pub transfers_in_flight: usize,

    /// Clock relock delay between negotiation steps.
    pub settle_delay_ms: u64,

    pub control_timeout_ms: u64,

    /// No completion within this window counts as sustained starvation.
    pub completion_timeout_ms: u64,

    /// How long `stop` waits for cancelled descriptors to come back.
    pub drain_timeout_ms: u64,

    /// Persistence thread sleep when the ring is empty.
    pub persistence_poll_ms: u64,

    /// Minimum interval between level notifications to the delegate.
    pub level_interval_ms: u64,

    /// Ring buffer capacity in seconds of audio (default: 4).
    pub ring_buffer_secs: f64,
}

impl CaptureConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample rate must be positive".into());
        }
        if ![16, 24, 32].contains(&self.bit_depth) {
            return Err(format!("unsupported bit depth: {}", self.bit_depth));
        }
        if self.channels == 0 || self.channels > 64 {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        if self.max_packets_per_transfer == 0 {
            return Err("max packets per transfer must be at least 1".into());
        }
        if self.transfers_in_flight < 2 {
            return Err(format!(
                "at least 2 transfers must be in flight, got {}",
                self.transfers_in_flight
            ));
        }
        if self.transfer_ceiling == Some(0) {
            return Err("transfer ceiling must be positive".into());
        }
        if !(self.ring_buffer_secs.is_finite() && self.ring_buffer_secs > 0.0) {
            return Err(format!("invalid ring buffer length: {}s", self.ring_buffer_secs));
        }
        Ok(())
    }

    /// Bytes in one interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn persistence_poll(&self) -> Duration {
        Duration::from_millis(self.persistence_poll_ms)
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.level_interval_ms)
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 24,
            interface: StreamingInterface::default(),
            transfer_ceiling: None,
            max_packets_per_transfer: 8,
            transfers_in_flight: 8,
            settle_delay_ms: 50,
            control_timeout_ms: 1000,
            completion_timeout_ms: 1000,
            drain_timeout_ms: 500,
            persistence_poll_ms: 2,
            level_interval_ms: 100,
            ring_buffer_secs: 4.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(CaptureConfiguration::default().validate().is_ok());
    }

    #[test]
    fn rejects_single_transfer_queue() {
        let config = CaptureConfiguration {
            transfers_in_flight: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_odd_bit_depth() {
        let config = CaptureConfiguration {
            bit_depth: 20,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("bit depth"));
    }

    #[test]
    fn frame_bytes_follow_layout() {
        let config = CaptureConfiguration {
            channels: 8,
            bit_depth: 24,
            ..Default::default()
        };
        assert_eq!(config.frame_bytes(), 24);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CaptureConfiguration =
            serde_json::from_str(r#"{ "sample_rate": 96000, "interface": { "clock_source_id": 5 } }"#).unwrap();
        assert_eq!(config.sample_rate, 96000);
        assert_eq!(config.interface.clock_source_id, 5);
        assert_eq!(config.interface.endpoint_address, 0x81);
        assert_eq!(config.transfers_in_flight, 8);
    }
}
