//! Opening a capture device and splitting it into transports.

use std::sync::Arc;

use parking_lot::Mutex;
use rusb::{Context, Device, DeviceHandle};

use uac_capture_core::models::config::{StreamingInterface, DEFAULT_TRANSFER_CEILING};
use uac_capture_core::models::error::CaptureError;

use crate::control::LibusbControlTransport;
use crate::device_enumerator::{DeviceEnumerator, UacDeviceInfo};
use crate::error::open_error;
use crate::iso::LibusbIsoTransport;

/// Open handle shared by the control and isochronous transports.
pub(crate) type SharedHandle = Arc<Mutex<DeviceHandle<Context>>>;

/// Tuning for the libusb transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Reported as the host transfer ceiling.
    pub transfer_ceiling: usize,
    /// Request `SCHED_FIFO` for the acquisition thread.
    pub realtime_priority: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            transfer_ceiling: DEFAULT_TRANSFER_CEILING,
            realtime_priority: true,
        }
    }
}

/// A claimed USB audio function.
///
/// Holds its own libusb context so event handling for one session never
/// services another session's transfers. Claimed interfaces are released
/// when the last transport drops the handle.
pub struct UacDevice {
    context: Context,
    handle: SharedHandle,
    info: UacDeviceInfo,
    interface: StreamingInterface,
}

impl UacDevice {
    /// Open the first capture device matching `vendor_id:product_id`.
    pub fn open(vendor_id: u16, product_id: u16, interface: &StreamingInterface) -> Result<Self, CaptureError> {
        let enumerator = DeviceEnumerator::new()?;
        let (device, info) = enumerator.find(vendor_id, product_id)?;
        Self::claim(enumerator.context().clone(), device, info, interface)
    }

    /// Open the capture device at a bus position.
    pub fn open_at(bus_number: u8, address: u8, interface: &StreamingInterface) -> Result<Self, CaptureError> {
        let enumerator = DeviceEnumerator::new()?;
        let (device, info) = enumerator.find_at(bus_number, address)?;
        Self::claim(enumerator.context().clone(), device, info, interface)
    }

    fn claim(
        context: Context,
        device: Device<Context>,
        info: UacDeviceInfo,
        interface: &StreamingInterface,
    ) -> Result<Self, CaptureError> {
        let mut handle = device.open().map_err(|e| open_error("open device", e))?;

        // Not supported on every platform; claiming reports the real problem.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("kernel driver auto-detach unavailable: {}", e);
        }

        let mut claimed = vec![interface.control_interface];
        if interface.streaming_interface != interface.control_interface {
            claimed.push(interface.streaming_interface);
        }
        for number in claimed {
            handle
                .claim_interface(number)
                .map_err(|e| open_error(&format!("claim interface {number}"), e))?;
        }

        log::info!(
            "opened {} at {:03}:{:03} (control if {}, streaming if {} alt {}, endpoint {:#04x})",
            info.display_name(),
            info.bus_number,
            info.address,
            interface.control_interface,
            interface.streaming_interface,
            interface.streaming_alt_setting,
            interface.endpoint_address
        );

        Ok(Self {
            context,
            handle: Arc::new(Mutex::new(handle)),
            info,
            interface: *interface,
        })
    }

    pub fn info(&self) -> &UacDeviceInfo {
        &self.info
    }

    pub fn interface(&self) -> &StreamingInterface {
        &self.interface
    }

    /// Split into the transports a `RecorderSession` drives.
    pub fn into_transports(self, options: &BackendOptions) -> (LibusbControlTransport, LibusbIsoTransport) {
        let control = LibusbControlTransport::new(Arc::clone(&self.handle));
        let iso = LibusbIsoTransport::new(self.context, self.handle, self.interface.endpoint_address, options);
        (control, iso)
    }
}
