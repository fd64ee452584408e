//! Control-endpoint transport over a libusb device handle.

use std::time::Duration;

use rusb::{Context, Device};

use uac_capture_core::models::error::TransportError;
use uac_capture_core::traits::usb_transport::ControlTransport;

use crate::device::SharedHandle;
use crate::device_enumerator::decode_max_packet_size;
use crate::error::transport_error;

pub struct LibusbControlTransport {
    handle: SharedHandle,
    /// Last alternate setting selected, by interface.
    active_alt: Option<(u8, u8)>,
}

impl LibusbControlTransport {
    pub(crate) fn new(handle: SharedHandle) -> Self {
        Self {
            handle,
            active_alt: None,
        }
    }
}

impl ControlTransport for LibusbControlTransport {
    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.handle
            .lock()
            .set_alternate_setting(interface, alt_setting)
            .map_err(transport_error)?;
        self.active_alt = Some((interface, alt_setting));
        Ok(())
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .lock()
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(transport_error)
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .lock()
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(transport_error)
    }

    fn max_packet_size(&mut self, endpoint: u8) -> Result<usize, TransportError> {
        let device = self.handle.lock().device();

        // SAFETY: `device` holds a reference on the underlying libusb_device.
        let size = unsafe { rusb::ffi::libusb_get_max_iso_packet_size(device.as_raw(), endpoint) };
        if size > 0 {
            return Ok(size as usize);
        }

        log::debug!(
            "libusb_get_max_iso_packet_size({:#04x}) returned {}; reading descriptors",
            endpoint,
            size
        );
        descriptor_max_packet_size(&device, endpoint, self.active_alt)
            .ok_or_else(|| TransportError::Other(format!("endpoint {endpoint:#04x} not in active configuration")))
    }
}

/// Endpoint size from the configuration descriptor, preferring `active`.
fn descriptor_max_packet_size(device: &Device<Context>, endpoint: u8, active: Option<(u8, u8)>) -> Option<usize> {
    let config = device.active_config_descriptor().ok()?;
    let mut largest = None;
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            for ep in setting.endpoint_descriptors() {
                if ep.address() != endpoint {
                    continue;
                }
                let size = decode_max_packet_size(ep.max_packet_size());
                if active == Some((setting.interface_number(), setting.setting_number())) {
                    return Some(size);
                }
                largest = largest.max(Some(size));
            }
        }
    }
    largest
}
