use serde::{Deserialize, Serialize};

/// Negotiated streaming format of the device.
///
/// Owned by the protocol controller; everything else receives copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFormat {
    /// Rate the caller asked for.
    pub requested_rate: u32,
    /// Rate the hardware reported back via `GET_CUR`.
    pub effective_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Bytes per isochronous packet for the active alternate setting.
    pub max_packet_size: usize,
}

impl DeviceFormat {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.effective_rate as u64 * self.frame_bytes() as u64
    }

    pub fn rate_mismatch(&self) -> bool {
        self.requested_rate != self.effective_rate
    }
}

/// Why a negotiation finished without the requested rate in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationWarning {
    /// `SET_CUR` was accepted but `GET_CUR` reports a different rate.
    RateMismatch,
    /// The requested rate is not in the device's advertised ranges; no change was made.
    RateUnsupported,
    /// Negotiation failed; the previously known-good format is still in use.
    FellBackToLastGood { reason: String },
}

/// Outcome of `negotiate_format`. Callers show both rates, never one in place of the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateNegotiation {
    pub requested_rate: u32,
    pub effective_rate: u32,
    pub format: DeviceFormat,
    pub warning: Option<NegotiationWarning>,
}

impl RateNegotiation {
    pub fn is_exact(&self) -> bool {
        self.warning.is_none() && self.requested_rate == self.effective_rate
    }
}

/// Real-time metering snapshot (peak 0.0–1.0 plus latched clip flag).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioLevels {
    pub peak: f32,
    pub clipped: bool,
}

/// Health counters for a capture session.
///
/// Everything here is visible while monitoring and recording; none of it is fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDiagnostics {
    pub transfers_reaped: u64,
    pub packets_accepted: u64,
    /// Packets flagged as overflowed/truncated by the host controller.
    pub packets_truncated: u64,
    pub packets_errored: u64,
    /// Packets whose length is not a whole number of frames.
    pub packets_malformed: u64,
    pub resubmit_failures: u64,
    pub bytes_captured: u64,
    pub ring_overruns: u64,
    pub ring_dropped_bytes: u64,
    pub bytes_written: u64,
}

impl CaptureDiagnostics {
    /// Packets discarded for any reason.
    pub fn packets_lost(&self) -> u64 {
        self.packets_truncated + self.packets_errored + self.packets_malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(requested: u32, effective: u32) -> DeviceFormat {
        DeviceFormat {
            requested_rate: requested,
            effective_rate: effective,
            channels: 4,
            bit_depth: 32,
            max_packet_size: 5104,
        }
    }

    #[test]
    fn frame_and_byte_rates() {
        let f = format(48000, 48000);
        assert_eq!(f.frame_bytes(), 16);
        assert_eq!(f.bytes_per_second(), 768_000);
        assert!(!f.rate_mismatch());
    }

    #[test]
    fn mismatch_keeps_both_rates() {
        let f = format(96000, 48000);
        let negotiation = RateNegotiation {
            requested_rate: 96000,
            effective_rate: 48000,
            format: f,
            warning: Some(NegotiationWarning::RateUnsupported),
        };
        assert!(f.rate_mismatch());
        assert!(!negotiation.is_exact());
        assert_eq!(negotiation.requested_rate, 96000);
        assert_eq!(negotiation.effective_rate, 48000);
    }

    #[test]
    fn packets_lost_sums_discards() {
        let d = CaptureDiagnostics {
            packets_truncated: 2,
            packets_errored: 1,
            packets_malformed: 3,
            ..Default::default()
        };
        assert_eq!(d.packets_lost(), 6);
    }
}
