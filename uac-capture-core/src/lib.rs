//! # uac-capture-core
//!
//! Platform-agnostic core of a USB Audio Class capture pipeline.
//!
//! Negotiates the device clock, keeps isochronous IN transfers queued,
//! buffers raw PCM in a lock-free ring, applies gain with clip detection and
//! streams recordings into RIFF/WAVE files that switch to RF64 past 4 GiB.
//! USB access goes through the [`ControlTransport`] and
//! [`IsochronousTransport`] traits; `uac-capture-libusb` implements them.
//!
//! ## Architecture
//!
//! ```text
//! uac-capture-core (this crate)
//! ├── traits/       ← ControlTransport, IsochronousTransport, RecorderControl, RecorderDelegate
//! ├── models/       ← CaptureError, RecorderState, CaptureConfiguration, DeviceFormat, etc.
//! ├── usb/          ← DeviceProtocolController (UAC2 requests), IsochronousTransferEngine
//! ├── processing/   ← CaptureRingBuffer, GainAndClipStage, RIFF/RF64 layout
//! ├── session/      ← RecorderSession (state machine + worker threads)
//! └── storage/      ← ContainerWriter, metadata sidecar
//! ```

pub mod models;
pub mod processing;
pub mod session;
pub mod storage;
pub mod traits;
pub mod usb;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root for convenience.
pub use models::audio_models::{AudioLevels, CaptureDiagnostics, DeviceFormat, NegotiationWarning, RateNegotiation};
pub use models::config::{CaptureConfiguration, StreamingInterface, DEFAULT_TRANSFER_CEILING};
pub use models::error::{CaptureError, TransportError};
pub use models::recording_result::{RecordingMetadata, RecordingResult};
pub use models::state::RecorderState;
pub use processing::gain_stage::GainAndClipStage;
pub use processing::ring_buffer::{CaptureRingBuffer, RingConsumer, RingProducer};
pub use processing::wav_format::{ContainerInfo, PcmFormat};
pub use session::recorder::RecorderSession;
pub use storage::container_writer::{ContainerSink, ContainerSummary, ContainerWriter, RecordingTarget};
pub use traits::recorder_control::RecorderControl;
pub use traits::recorder_delegate::RecorderDelegate;
pub use traits::usb_transport::{
    ControlTransport, DescriptorState, IsoPacket, IsochronousTransport, PacketStatus, TransferDescriptor,
};
pub use usb::protocol::DeviceProtocolController;
pub use usb::transfer_engine::{IsochronousTransferEngine, TransferGeometry, TransferStats};
