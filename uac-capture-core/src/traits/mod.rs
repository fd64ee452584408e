pub mod recorder_control;
pub mod recorder_delegate;
pub mod usb_transport;
