//! USB Audio Class 2.0 clock and interface control.

use std::thread;
use std::time::Duration;

use crate::models::audio_models::{DeviceFormat, NegotiationWarning, RateNegotiation};
use crate::models::config::{CaptureConfiguration, StreamingInterface};
use crate::models::error::{CaptureError, TransportError};
use crate::traits::usb_transport::ControlTransport;

/// Class request, host-to-device, interface recipient.
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
/// Class request, device-to-host, interface recipient.
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;

pub const REQUEST_CUR: u8 = 0x01;
pub const REQUEST_RANGE: u8 = 0x02;

/// Clock Source control selector for the sampling frequency.
pub const CS_SAM_FREQ_CONTROL: u8 = 0x01;

/// Rates checked against continuous RANGE sub-ranges.
pub const STANDARD_RATES: [u32; 8] = [44100, 48000, 88200, 96000, 176400, 192000, 352800, 384000];

const MAX_SUB_RANGES: usize = 64;

/// Owns the control side of the audio function and the negotiated [`DeviceFormat`].
///
/// Rate negotiation always runs in the same order, with the settle delay
/// between every step:
///
/// 1. streaming interface → alternate setting 0
/// 2. `SET_CUR` sampling frequency on the clock source
/// 3. streaming interface → streaming alternate setting
/// 4. `GET_CUR` read-back
pub struct DeviceProtocolController<C: ControlTransport> {
    transport: C,
    interface: StreamingInterface,
    channels: u16,
    bit_depth: u16,
    settle_delay: Duration,
    control_timeout: Duration,
    streaming: bool,
    format: Option<DeviceFormat>,
}

impl<C: ControlTransport> DeviceProtocolController<C> {
    pub fn new(transport: C, config: &CaptureConfiguration) -> Self {
        Self {
            transport,
            interface: config.interface,
            channels: config.channels,
            bit_depth: config.bit_depth,
            settle_delay: config.settle_delay(),
            control_timeout: config.control_timeout(),
            // Unknown until the first alt-setting switch; assume the device is idle
            streaming: false,
            format: None,
        }
    }

    /// Last successfully negotiated format.
    pub fn format(&self) -> Option<DeviceFormat> {
        self.format
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn transport(&self) -> &C {
        &self.transport
    }

    /// Configure the clock for `requested_rate` and read back what the hardware chose.
    ///
    /// A differing read-back is reported in the result, never substituted or
    /// treated as an error.
    pub fn negotiate_format(&mut self, requested_rate: u32) -> Result<RateNegotiation, CaptureError> {
        if requested_rate == 0 {
            return Err(CaptureError::ConfigurationFailed("sample rate must be positive".into()));
        }

        let supported = self.supported_sample_rates()?;
        let unsupported = !supported.is_empty() && !supported.contains(&requested_rate);
        if unsupported {
            log::warn!(
                "Device does not advertise {} Hz (supports {:?}), keeping current rate",
                requested_rate,
                supported
            );
        }

        // The clock is in an unknown state until the read-back succeeds
        self.format = None;
        self.select_alt_setting(0, "disable streaming")?;
        self.settle();

        if !unsupported {
            self.set_cur_rate(requested_rate)?;
            self.settle();
        }

        self.select_alt_setting(self.interface.streaming_alt_setting, "enable streaming")?;
        self.settle();

        let effective_rate = self.get_cur_rate()?;
        let max_packet_size = self
            .transport
            .max_packet_size(self.interface.endpoint_address)
            .map_err(|e| e.into_control_error("read max packet size"))?;

        let format = DeviceFormat {
            requested_rate,
            effective_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
            max_packet_size,
        };
        self.format = Some(format);

        let warning = if unsupported {
            Some(NegotiationWarning::RateUnsupported)
        } else if effective_rate != requested_rate {
            log::warn!(
                "Requested {} Hz but device reports {} Hz",
                requested_rate,
                effective_rate
            );
            Some(NegotiationWarning::RateMismatch)
        } else {
            None
        };

        log::info!(
            "Negotiated {} Hz (requested {} Hz), {} ch, {} bit, {} byte packets",
            effective_rate,
            requested_rate,
            self.channels,
            self.bit_depth,
            max_packet_size
        );

        Ok(RateNegotiation {
            requested_rate,
            effective_rate,
            format,
            warning,
        })
    }

    /// Put the clock back to a previously negotiated format.
    ///
    /// Runs the same alt 0 / `SET_CUR` / streaming alt / `GET_CUR` sequence as
    /// [`negotiate_format`](Self::negotiate_format). The format is only
    /// recorded again when the read-back matches `format.effective_rate`.
    pub fn restore_format(&mut self, format: DeviceFormat) -> Result<DeviceFormat, CaptureError> {
        let rate = format.effective_rate;
        self.format = None;

        self.select_alt_setting(0, "disable streaming")?;
        self.settle();
        self.set_cur_rate(rate)?;
        self.settle();
        self.select_alt_setting(self.interface.streaming_alt_setting, "enable streaming")?;
        self.settle();

        let effective_rate = self.get_cur_rate()?;
        if effective_rate != rate {
            return Err(CaptureError::DeviceRejected(format!(
                "clock reports {effective_rate} Hz after restoring {rate} Hz"
            )));
        }
        let max_packet_size = self
            .transport
            .max_packet_size(self.interface.endpoint_address)
            .map_err(|e| e.into_control_error("read max packet size"))?;

        let restored = DeviceFormat {
            max_packet_size,
            ..format
        };
        self.format = Some(restored);
        log::info!("Restored clock to {} Hz", rate);
        Ok(restored)
    }

    /// Rates advertised by the clock source's `RANGE` reply.
    ///
    /// A device that stalls or rejects the request yields an empty list.
    pub fn supported_sample_rates(&mut self) -> Result<Vec<u32>, CaptureError> {
        let mut count = [0u8; 2];
        match self.range_request(&mut count) {
            Ok(n) if n >= 2 => {}
            Ok(_) => return Ok(Vec::new()),
            Err(TransportError::Stall) | Err(TransportError::Other(_)) => {
                log::debug!("Clock source does not answer RANGE requests");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into_control_error("RANGE")),
        }

        let sub_ranges = (u16::from_le_bytes(count) as usize).min(MAX_SUB_RANGES);
        let mut block = vec![0u8; 2 + sub_ranges * 12];
        let received = match self.range_request(&mut block) {
            Ok(n) => n,
            Err(TransportError::Stall) | Err(TransportError::Other(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into_control_error("RANGE")),
        };

        Ok(parse_range_block(&block[..received]))
    }

    /// Switch the streaming interface on or off. Idempotent.
    pub fn set_streaming(&mut self, enabled: bool) -> Result<(), CaptureError> {
        if enabled == self.streaming {
            return Ok(());
        }
        if enabled {
            self.select_alt_setting(self.interface.streaming_alt_setting, "enable streaming")?;
        } else {
            self.select_alt_setting(0, "disable streaming")?;
        }
        self.settle();
        Ok(())
    }

    fn select_alt_setting(&mut self, alt_setting: u8, step: &str) -> Result<(), CaptureError> {
        self.transport
            .set_alternate_setting(self.interface.streaming_interface, alt_setting)
            .map_err(|e| e.into_control_error(step))?;
        self.streaming = alt_setting != 0;
        log::debug!(
            "Interface {} → alt {}",
            self.interface.streaming_interface,
            alt_setting
        );
        Ok(())
    }

    fn set_cur_rate(&mut self, rate: u32) -> Result<(), CaptureError> {
        let written = self
            .transport
            .control_out(
                REQUEST_TYPE_CLASS_OUT,
                REQUEST_CUR,
                frequency_control_value(),
                self.clock_index(),
                &rate.to_le_bytes(),
                self.control_timeout,
            )
            .map_err(|e| e.into_control_error("SET_CUR sampling frequency"))?;
        if written != 4 {
            return Err(CaptureError::DeviceRejected(format!(
                "SET_CUR sampling frequency: short write ({written} of 4 bytes)"
            )));
        }
        Ok(())
    }

    fn get_cur_rate(&mut self) -> Result<u32, CaptureError> {
        let mut buf = [0u8; 4];
        let received = self
            .transport
            .control_in(
                REQUEST_TYPE_CLASS_IN,
                REQUEST_CUR,
                frequency_control_value(),
                self.clock_index(),
                &mut buf,
                self.control_timeout,
            )
            .map_err(|e| e.into_control_error("GET_CUR sampling frequency"))?;
        if received < 4 {
            return Err(CaptureError::DeviceRejected(format!(
                "GET_CUR sampling frequency: short reply ({received} bytes)"
            )));
        }
        match u32::from_le_bytes(buf) {
            0 => Err(CaptureError::DeviceRejected("device reports a 0 Hz clock".into())),
            rate => Ok(rate),
        }
    }

    fn range_request(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let index = self.clock_index();
        self.transport.control_in(
            REQUEST_TYPE_CLASS_IN,
            REQUEST_RANGE,
            frequency_control_value(),
            index,
            buf,
            self.control_timeout,
        )
    }

    fn clock_index(&self) -> u16 {
        clock_request_index(self.interface.clock_source_id, self.interface.control_interface)
    }

    fn settle(&self) {
        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }
    }
}

/// `wValue` for sampling-frequency requests.
pub fn frequency_control_value() -> u16 {
    (CS_SAM_FREQ_CONTROL as u16) << 8
}

/// `wIndex` addressing a clock entity through the AudioControl interface.
pub fn clock_request_index(clock_id: u8, control_interface: u8) -> u16 {
    ((clock_id as u16) << 8) | control_interface as u16
}

/// Decode a layout-3 `RANGE` parameter block into a sorted rate list.
///
/// Discrete entries (`min == max`) are taken as-is. Continuous entries are
/// intersected with [`STANDARD_RATES`], honouring the resolution.
pub fn parse_range_block(block: &[u8]) -> Vec<u32> {
    if block.len() < 2 {
        return Vec::new();
    }
    let declared = u16::from_le_bytes([block[0], block[1]]) as usize;
    let mut rates = Vec::new();

    for triple in block[2..].chunks_exact(12).take(declared) {
        let min = u32::from_le_bytes([triple[0], triple[1], triple[2], triple[3]]);
        let max = u32::from_le_bytes([triple[4], triple[5], triple[6], triple[7]]);
        let res = u32::from_le_bytes([triple[8], triple[9], triple[10], triple[11]]);

        if min == max {
            if min > 0 {
                rates.push(min);
            }
            continue;
        }
        rates.extend(
            STANDARD_RATES
                .iter()
                .copied()
                .filter(|&rate| rate >= min && rate <= max)
                .filter(|&rate| res == 0 || (rate - min) % res == 0),
        );
    }

    rates.sort_unstable();
    rates.dedup();
    rates
}
