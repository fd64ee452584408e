//! Mapping of libusb status codes onto the core transport taxonomy.

use std::os::raw::c_int;

use rusb::ffi::constants::{
    LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
};
use uac_capture_core::models::error::{CaptureError, TransportError};

/// Translate a safe-API failure.
pub fn transport_error(error: rusb::Error) -> TransportError {
    match error {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::NoDevice => TransportError::Disconnected,
        other => TransportError::Other(other.to_string()),
    }
}

/// Translate a negative return code from a raw libusb call.
pub fn transport_error_from_code(call: &str, code: c_int) -> TransportError {
    match code {
        LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
        LIBUSB_ERROR_PIPE => TransportError::Stall,
        LIBUSB_ERROR_NO_DEVICE => TransportError::Disconnected,
        _ => TransportError::Other(format!("{call}: {}", code_name(code))),
    }
}

/// Errors while locating or opening a device, before any transport exists.
pub fn open_error(step: &str, error: rusb::Error) -> CaptureError {
    match error {
        rusb::Error::NoDevice | rusb::Error::NotFound => CaptureError::DeviceNotAvailable,
        rusb::Error::Access | rusb::Error::Busy => {
            CaptureError::DeviceRejected(format!("{step}: {error}"))
        }
        other => CaptureError::ConfigurationFailed(format!("{step}: {other}")),
    }
}

fn code_name(code: c_int) -> String {
    let name = match code {
        LIBUSB_ERROR_IO => "input/output error",
        LIBUSB_ERROR_INVALID_PARAM => "invalid parameter",
        LIBUSB_ERROR_ACCESS => "access denied",
        LIBUSB_ERROR_NOT_FOUND => "entity not found",
        LIBUSB_ERROR_BUSY => "resource busy",
        LIBUSB_ERROR_OVERFLOW => "overflow",
        LIBUSB_ERROR_NO_MEM => "insufficient memory",
        _ => return format!("libusb error {code}"),
    };
    name.to_string()
}
