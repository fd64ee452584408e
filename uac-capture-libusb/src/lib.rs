//! # uac-capture-libusb
//!
//! libusb backend for uac-capture-kit.
//!
//! Provides:
//! - `DeviceEnumerator`: discovery of USB Audio Class capture functions
//! - `UacDevice`: opens a device, claims its interfaces and splits it into transports
//! - `LibusbControlTransport`: class requests and alternate settings on endpoint 0
//! - `LibusbIsoTransport`: isochronous IN transfers on libusb's asynchronous API
//!
//! ## Platform Requirements
//! - libusb 1.0.22+ (found through pkg-config, or vendored by `libusb1-sys`)
//! - Linux: read/write access to the device node (udev rule or group membership)
//! - Real-time scheduling of the acquisition thread needs `CAP_SYS_NICE` or an rtprio limit
//!
//! ## Usage
//! ```ignore
//! use uac_capture_core::{CaptureConfiguration, RecorderControl, RecorderSession};
//! use uac_capture_libusb::{BackendOptions, UacDevice};
//!
//! let config = CaptureConfiguration::default();
//! let device = UacDevice::open(0x1235, 0x8211, &config.interface)?;
//! let (control, iso) = device.into_transports(&BackendOptions::default());
//! let mut session = RecorderSession::new(control, iso, config)?;
//! session.negotiate_format(96000)?;
//! session.start_monitoring(0.0)?;
//! ```

pub mod control;
pub mod device;
pub mod device_enumerator;
pub mod error;
pub mod iso;
pub mod priority;

pub use control::LibusbControlTransport;
pub use device::{BackendOptions, UacDevice};
pub use device_enumerator::{CaptureEndpoint, DeviceEnumerator, UacDeviceInfo};
pub use iso::LibusbIsoTransport;
