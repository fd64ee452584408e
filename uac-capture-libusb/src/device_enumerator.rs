//! USB Audio Class device discovery via libusb.
//!
//! Walks the active configuration of every attached device and reports the
//! ones exposing an AudioStreaming interface with an isochronous IN
//! endpoint, together with the addressing needed to drive them.

use rusb::{Context, Device, Direction, InterfaceDescriptor, TransferType, UsageType, UsbContext};

use uac_capture_core::models::config::StreamingInterface;
use uac_capture_core::models::error::CaptureError;

use crate::error::open_error;

const CLASS_AUDIO: u8 = 0x01;
const SUBCLASS_AUDIOCONTROL: u8 = 0x01;
const SUBCLASS_AUDIOSTREAMING: u8 = 0x02;
/// `bInterfaceProtocol` of UAC2 interfaces.
const PROTOCOL_UAC2: u8 = 0x20;

const CS_INTERFACE: u8 = 0x24;
const AC_CLOCK_SOURCE: u8 = 0x0A;

/// One isochronous IN endpoint reachable through an alternate setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEndpoint {
    pub streaming_interface: u8,
    pub alt_setting: u8,
    pub endpoint_address: u8,
    /// Bytes per service interval, high-bandwidth multiplier applied.
    pub max_packet_size: usize,
}

/// A USB audio function able to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UacDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Whether the streaming interfaces speak UAC2.
    pub uac2: bool,
    pub control_interface: Option<u8>,
    /// Clock Source entity ids found in the AudioControl descriptors.
    pub clock_sources: Vec<u8>,
    pub endpoints: Vec<CaptureEndpoint>,
}

impl UacDeviceInfo {
    /// Addressing for the first capture endpoint and clock source.
    pub fn suggested_interface(&self) -> Option<StreamingInterface> {
        let endpoint = self.endpoints.first()?;
        Some(StreamingInterface {
            control_interface: self.control_interface?,
            streaming_interface: endpoint.streaming_interface,
            streaming_alt_setting: endpoint.alt_setting,
            clock_source_id: *self.clock_sources.first()?,
            endpoint_address: endpoint.endpoint_address,
        })
    }

    /// Human-readable label for listings.
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{m} {p}"),
            (None, Some(p)) => p.clone(),
            _ => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// Audio device enumerator over a private libusb context.
pub struct DeviceEnumerator {
    context: Context,
}

impl DeviceEnumerator {
    pub fn new() -> Result<Self, CaptureError> {
        let context = Context::new().map_err(|e| open_error("libusb init", e))?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// List attached devices with at least one capture endpoint.
    pub fn list_capture_devices(&self) -> Result<Vec<UacDeviceInfo>, CaptureError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| open_error("list devices", e))?;

        let mut found = Vec::new();
        for device in devices.iter() {
            match describe(&device) {
                Ok(Some(info)) => found.push(info),
                Ok(None) => {}
                Err(e) => log::debug!(
                    "skipping device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(found)
    }

    /// Find a capture device by vendor and product id.
    pub fn find(&self, vendor_id: u16, product_id: u16) -> Result<(Device<Context>, UacDeviceInfo), CaptureError> {
        self.find_by(|info| info.vendor_id == vendor_id && info.product_id == product_id)
    }

    /// Find a capture device by bus position.
    pub fn find_at(&self, bus_number: u8, address: u8) -> Result<(Device<Context>, UacDeviceInfo), CaptureError> {
        self.find_by(|info| info.bus_number == bus_number && info.address == address)
    }

    fn find_by(
        &self,
        matches: impl Fn(&UacDeviceInfo) -> bool,
    ) -> Result<(Device<Context>, UacDeviceInfo), CaptureError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| open_error("list devices", e))?;
        for device in devices.iter() {
            if let Ok(Some(info)) = describe(&device) {
                if matches(&info) {
                    return Ok((device, info));
                }
            }
        }
        Err(CaptureError::DeviceNotAvailable)
    }
}

/// Inspect one device. `Ok(None)` when it has no capture endpoint.
pub fn describe<T: UsbContext>(device: &Device<T>) -> Result<Option<UacDeviceInfo>, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    let mut control_interface = None;
    let mut clock_sources = Vec::new();
    let mut endpoints = Vec::new();
    let mut uac2 = false;

    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            if setting.class_code() != CLASS_AUDIO {
                continue;
            }
            match setting.sub_class_code() {
                SUBCLASS_AUDIOCONTROL => {
                    control_interface.get_or_insert(setting.interface_number());
                    for id in clock_source_ids(setting.extra()) {
                        if !clock_sources.contains(&id) {
                            clock_sources.push(id);
                        }
                    }
                }
                SUBCLASS_AUDIOSTREAMING => {
                    uac2 |= setting.protocol_code() == PROTOCOL_UAC2;
                    endpoints.extend(capture_endpoints(&setting));
                }
                _ => {}
            }
        }
    }

    if endpoints.is_empty() {
        return Ok(None);
    }

    let (manufacturer, product, serial_number) = match device.open() {
        Ok(handle) => (
            handle.read_manufacturer_string_ascii(&descriptor).ok(),
            handle.read_product_string_ascii(&descriptor).ok(),
            handle.read_serial_number_string_ascii(&descriptor).ok(),
        ),
        Err(e) => {
            log::debug!("cannot open {:04x}:{:04x} for strings: {}", descriptor.vendor_id(), descriptor.product_id(), e);
            (None, None, None)
        }
    };

    Ok(Some(UacDeviceInfo {
        bus_number: device.bus_number(),
        address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        manufacturer,
        product,
        serial_number,
        uac2,
        control_interface,
        clock_sources,
        endpoints,
    }))
}

fn capture_endpoints(setting: &InterfaceDescriptor<'_>) -> Vec<CaptureEndpoint> {
    setting
        .endpoint_descriptors()
        .filter(|ep| ep.direction() == Direction::In && ep.transfer_type() == TransferType::Isochronous)
        .filter(|ep| ep.usage_type() != UsageType::Feedback)
        .map(|ep| CaptureEndpoint {
            streaming_interface: setting.interface_number(),
            alt_setting: setting.setting_number(),
            endpoint_address: ep.address(),
            max_packet_size: decode_max_packet_size(ep.max_packet_size()),
        })
        .collect()
}

/// Bytes per service interval from a raw `wMaxPacketSize`.
///
/// Bits 10..0 hold the transaction size, bits 12..11 the number of
/// additional high-bandwidth transactions.
pub fn decode_max_packet_size(raw: u16) -> usize {
    let base = (raw & 0x07ff) as usize;
    let transactions = 1 + ((raw >> 11) & 0x03) as usize;
    base * transactions
}

/// Clock Source ids in a class-specific AudioControl descriptor block.
pub fn clock_source_ids(extra: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut rest = extra;
    while rest.len() >= 2 {
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            break;
        }
        let block = &rest[..len];
        if block[1] == CS_INTERFACE && len > 3 && block[2] == AC_CLOCK_SOURCE {
            ids.push(block[3]);
        }
        rest = &rest[len..];
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_packet_size_applies_multiplier() {
        assert_eq!(decode_max_packet_size(0x0064), 100);
        // 1024 bytes, 3 transactions per microframe.
        assert_eq!(decode_max_packet_size(0x1400), 3072);
        assert_eq!(decode_max_packet_size(0x0800 | 0x0200), 1024);
    }

    #[test]
    fn clock_sources_found_among_other_units() {
        let extra = [
            // AC header
            9, 0x24, 0x01, 0x00, 0x02, 0x08, 0x40, 0x00, 0x00,
            // Clock source id 0x29
            8, 0x24, 0x0A, 0x29, 0x03, 0x07, 0x00, 0x00,
            // Input terminal
            17, 0x24, 0x02, 0x01, 0x01, 0x02, 0x00, 0x29, 0x02, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            // Second clock source id 0x05
            8, 0x24, 0x0A, 0x05, 0x01, 0x07, 0x00, 0x00,
        ];
        assert_eq!(clock_source_ids(&extra), vec![0x29, 0x05]);
    }

    #[test]
    fn truncated_descriptor_block_stops_cleanly() {
        let extra = [8, 0x24, 0x0A, 0x29, 0x03, 0x07, 0x00, 0x00, 40, 0x24, 0x0A];
        assert_eq!(clock_source_ids(&extra), vec![0x29]);
        assert!(clock_source_ids(&[0, 0x24, 0x0A]).is_empty());
    }

    fn info() -> UacDeviceInfo {
        UacDeviceInfo {
            bus_number: 1,
            address: 7,
            vendor_id: 0x1235,
            product_id: 0x8211,
            manufacturer: None,
            product: None,
            serial_number: None,
            uac2: true,
            control_interface: Some(0),
            clock_sources: vec![0x29],
            endpoints: vec![CaptureEndpoint {
                streaming_interface: 2,
                alt_setting: 1,
                endpoint_address: 0x82,
                max_packet_size: 632,
            }],
        }
    }

    #[test]
    fn suggested_interface_uses_first_endpoint() {
        let iface = info().suggested_interface().unwrap();
        assert_eq!(iface.control_interface, 0);
        assert_eq!(iface.streaming_interface, 2);
        assert_eq!(iface.streaming_alt_setting, 1);
        assert_eq!(iface.clock_source_id, 0x29);
        assert_eq!(iface.endpoint_address, 0x82);
    }

    #[test]
    fn no_suggestion_without_clock_source() {
        let mut info = info();
        info.clock_sources.clear();
        assert!(info.suggested_interface().is_none());
    }

    #[test]
    fn display_name_falls_back_to_ids() {
        let mut info = info();
        assert_eq!(info.display_name(), "1235:8211");
        info.product = Some("Interface".into());
        info.manufacturer = Some("Acme".into());
        assert_eq!(info.display_name(), "Acme Interface");
    }
}
