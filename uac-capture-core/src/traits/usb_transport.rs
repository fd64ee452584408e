use std::time::Duration;

use crate::models::error::TransportError;

/// Blocking control-endpoint access to a claimed USB audio function.
///
/// Implemented by the libusb backend and by test mocks. The signatures follow
/// the raw setup-packet fields so the protocol layer owns all UAC encoding.
pub trait ControlTransport: Send {
    /// `SET_INTERFACE`.
    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Host-to-device class request. Returns bytes sent.
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Device-to-host class request. Returns bytes received.
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Bytes per service interval of `endpoint` under the active alternate setting.
    fn max_packet_size(&mut self, endpoint: u8) -> Result<usize, TransportError>;
}

/// Completion status of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Not yet completed since the last submission.
    Pending,
    Completed,
    /// The device sent more than requested; the host truncated the packet.
    Overflow,
    /// Any other per-packet failure (CRC, bitstuff, missed frame).
    Error,
}

/// Sub-descriptor for one packet inside a [`TransferDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of this packet's slot within the descriptor buffer.
    pub offset: usize,
    pub requested: usize,
    pub actual: usize,
    pub status: PacketStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    Ready,
    InFlight,
}

/// One reusable isochronous IN request.
///
/// Buffers and packet tables are allocated once and reused on every
/// resubmission. A descriptor is either ready or in flight, never both.
#[derive(Debug)]
pub struct TransferDescriptor {
    pub slot: usize,
    pub buffer: Box<[u8]>,
    pub packets: Box<[IsoPacket]>,
    /// Submission sequence number; increases on every submit.
    pub sequence: u64,
    state: DescriptorState,
}

impl TransferDescriptor {
    pub fn new(slot: usize, packet_size: usize, packets_per_transfer: usize) -> Self {
        let packets = (0..packets_per_transfer)
            .map(|i| IsoPacket {
                offset: i * packet_size,
                requested: packet_size,
                actual: 0,
                status: PacketStatus::Pending,
            })
            .collect();
        Self {
            slot,
            buffer: vec![0u8; packet_size * packets_per_transfer].into_boxed_slice(),
            packets,
            sequence: 0,
            state: DescriptorState::Ready,
        }
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == DescriptorState::InFlight
    }

    /// Reset packet results and flag the descriptor as submitted.
    pub fn mark_in_flight(&mut self, sequence: u64) {
        for packet in self.packets.iter_mut() {
            packet.actual = 0;
            packet.status = PacketStatus::Pending;
        }
        self.sequence = sequence;
        self.state = DescriptorState::InFlight;
    }

    pub fn mark_ready(&mut self) {
        self.state = DescriptorState::Ready;
    }

    /// Bytes the device delivered for packet `index`, clamped to its slot.
    pub fn packet_data(&self, index: usize) -> &[u8] {
        let packet = &self.packets[index];
        let len = packet.actual.min(packet.requested);
        &self.buffer[packet.offset..packet.offset + len]
    }
}

/// Asynchronous isochronous IN transport.
///
/// The engine drives it from the acquisition thread only. Completion is a
/// blocking poll, never a callback into engine code.
pub trait IsochronousTransport: Send {
    /// Largest transfer the host stack accepts, in bytes.
    fn transfer_ceiling(&self) -> usize;

    /// Allocate native transfer objects for every descriptor in `pool`.
    fn allocate(&mut self, pool: &mut [TransferDescriptor]) -> Result<(), TransportError>;

    /// Queue `descriptor` against the endpoint. The engine marks it in flight first.
    fn submit(&mut self, descriptor: &mut TransferDescriptor) -> Result<(), TransportError>;

    /// Block until at least one descriptor completes or `timeout` elapses.
    ///
    /// Completed slots are pushed onto `completed` with their packet tables
    /// filled in. Descriptors that finished because they were cancelled are
    /// reported too.
    fn wait_for_completions(
        &mut self,
        pool: &mut [TransferDescriptor],
        completed: &mut Vec<usize>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Request cancellation. Completion still arrives through `wait_for_completions`.
    fn cancel(&mut self, descriptor: &TransferDescriptor) -> Result<(), TransportError>;

    /// Free native transfer objects.
    ///
    /// Every descriptor the transport got back is marked ready. One left in
    /// flight is still owned by the host stack and its buffer must not be freed.
    fn release(&mut self, pool: &mut [TransferDescriptor]);

    /// Called once on the acquisition thread before the first submit.
    fn prepare_acquisition_thread(&mut self) {}
}
