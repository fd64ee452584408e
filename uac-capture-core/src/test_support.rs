//! Scripted USB transports and an in-memory sink for unit tests.

use std::collections::VecDeque;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::error::TransportError;
use crate::traits::usb_transport::{ControlTransport, IsochronousTransport, PacketStatus, TransferDescriptor};
use crate::usb::protocol::{REQUEST_CUR, REQUEST_RANGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    SetAlt { interface: u8, alt: u8 },
    SetCur { rate: u32, index: u16 },
    GetCur { index: u16 },
    Range,
    MaxPacketSize { endpoint: u8 },
}

#[derive(Debug)]
struct ControlState {
    current_rate: u32,
    /// Discrete rates answered to RANGE; empty means RANGE stalls.
    supported: Vec<u32>,
    /// SET_CUR is accepted but the clock stays here.
    locked: bool,
    max_packet_size: usize,
    calls: Vec<ControlCall>,
    set_cur_failure: Option<Failure>,
    get_cur_failure: Option<Failure>,
}

/// A scripted error, either for the next `remaining` calls or for good.
#[derive(Debug)]
struct Failure {
    error: TransportError,
    remaining: Option<usize>,
}

impl Failure {
    /// The error for this call, if the failure is still armed.
    fn fire(slot: &mut Option<Failure>) -> Option<TransportError> {
        let failure = slot.as_mut()?;
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            *slot = None;
        }
        Some(error)
    }
}

/// Fake audio function clock. Clones share state so tests can inspect calls.
#[derive(Debug, Clone)]
pub struct MockControlTransport {
    state: Arc<Mutex<ControlState>>,
}

impl MockControlTransport {
    pub fn with_rates(current_rate: u32, supported: &[u32]) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                current_rate,
                supported: supported.to_vec(),
                locked: false,
                max_packet_size: 16,
                calls: Vec::new(),
                set_cur_failure: None,
                get_cur_failure: None,
            })),
        }
    }

    /// Device that ignores rate changes and does not answer RANGE.
    pub fn locked_at(rate: u32) -> Self {
        let mock = Self::with_rates(rate, &[]);
        mock.state.lock().locked = true;
        mock
    }

    pub fn set_max_packet_size(&self, size: usize) {
        self.state.lock().max_packet_size = size;
    }

    pub fn fail_set_cur(&self, error: TransportError) {
        self.state.lock().set_cur_failure = Some(Failure { error, remaining: None });
    }

    pub fn fail_get_cur(&self, error: TransportError) {
        self.state.lock().get_cur_failure = Some(Failure { error, remaining: None });
    }

    /// Fail only the next `n` SET_CUR requests.
    pub fn fail_next_set_cur(&self, error: TransportError, n: usize) {
        if n > 0 {
            self.state.lock().set_cur_failure = Some(Failure {
                error,
                remaining: Some(n),
            });
        }
    }

    /// Fail only the next `n` GET_CUR requests.
    pub fn fail_next_get_cur(&self, error: TransportError, n: usize) {
        if n > 0 {
            self.state.lock().get_cur_failure = Some(Failure {
                error,
                remaining: Some(n),
            });
        }
    }

    pub fn current_rate(&self) -> u32 {
        self.state.lock().current_rate
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.set_cur_failure = None;
        state.get_cur_failure = None;
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.state.lock().calls.clone()
    }
}

impl ControlTransport for MockControlTransport {
    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.state.lock().calls.push(ControlCall::SetAlt {
            interface,
            alt: alt_setting,
        });
        Ok(())
    }

    fn control_out(
        &mut self,
        _request_type: u8,
        request: u8,
        _value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if request != REQUEST_CUR || data.len() != 4 {
            return Err(TransportError::Stall);
        }
        let rate = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        state.calls.push(ControlCall::SetCur { rate, index });
        if let Some(error) = Failure::fire(&mut state.set_cur_failure) {
            return Err(error);
        }
        if !state.locked {
            state.current_rate = rate;
        }
        Ok(4)
    }

    fn control_in(
        &mut self,
        _request_type: u8,
        request: u8,
        _value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        match request {
            REQUEST_CUR => {
                state.calls.push(ControlCall::GetCur { index });
                if let Some(error) = Failure::fire(&mut state.get_cur_failure) {
                    return Err(error);
                }
                let bytes = state.current_rate.to_le_bytes();
                let n = buf.len().min(4);
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            REQUEST_RANGE => {
                state.calls.push(ControlCall::Range);
                if state.supported.is_empty() {
                    return Err(TransportError::Stall);
                }
                let mut block = (state.supported.len() as u16).to_le_bytes().to_vec();
                for rate in &state.supported {
                    block.extend_from_slice(&rate.to_le_bytes());
                    block.extend_from_slice(&rate.to_le_bytes());
                    block.extend_from_slice(&0u32.to_le_bytes());
                }
                let n = buf.len().min(block.len());
                buf[..n].copy_from_slice(&block[..n]);
                Ok(n)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn max_packet_size(&mut self, endpoint: u8) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        state.calls.push(ControlCall::MaxPacketSize { endpoint });
        Ok(state.max_packet_size)
    }
}

#[derive(Debug)]
struct IsoState {
    ceiling: usize,
    /// Repeated to fill every delivered packet.
    pattern: Vec<u8>,
    /// Per-packet overrides consumed in delivery order.
    overrides: VecDeque<(usize, PacketStatus)>,
    completions_per_wait: usize,
    /// Stop delivering after this many completions.
    completion_limit: Option<u64>,
    disconnected: bool,
    failing_submits: usize,
    failing_allocations: usize,
    /// Cancelled descriptors are never handed back.
    hold_cancelled: bool,
    pacing: Duration,
    submitted: u64,
    completed: u64,
    cancelled: u64,
    allocated: usize,
    released: bool,
    prepared: bool,
}

/// Fake isochronous endpoint that completes descriptors in submission order.
#[derive(Debug, Clone)]
pub struct MockIsoTransport {
    state: Arc<Mutex<IsoState>>,
    queue: Arc<Mutex<VecDeque<(usize, bool)>>>,
}

impl MockIsoTransport {
    pub fn new(ceiling: usize, pattern: &[u8]) -> Self {
        Self {
            state: Arc::new(Mutex::new(IsoState {
                ceiling,
                pattern: pattern.to_vec(),
                overrides: VecDeque::new(),
                completions_per_wait: 1,
                completion_limit: None,
                disconnected: false,
                failing_submits: 0,
                failing_allocations: 0,
                hold_cancelled: false,
                pacing: Duration::from_micros(200),
                submitted: 0,
                completed: 0,
                cancelled: 0,
                allocated: 0,
                released: false,
                prepared: false,
            })),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn set_pattern(&self, pattern: &[u8]) {
        self.state.lock().pattern = pattern.to_vec();
    }

    pub fn override_packets(&self, packets: &[(usize, PacketStatus)]) {
        self.state.lock().overrides.extend(packets.iter().copied());
    }

    pub fn set_completions_per_wait(&self, n: usize) {
        self.state.lock().completions_per_wait = n;
    }

    pub fn stop_completing_after(&self, completions: u64) {
        self.state.lock().completion_limit = Some(completions);
    }

    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub fn fail_next_submits(&self, n: usize) {
        self.state.lock().failing_submits = n;
    }

    pub fn fail_next_allocations(&self, n: usize) {
        self.state.lock().failing_allocations = n;
    }

    /// Model a host stack that still owns cancelled transfers.
    pub fn hold_cancelled(&self) {
        self.state.lock().hold_cancelled = true;
    }

    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn cancelled(&self) -> u64 {
        self.state.lock().cancelled
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn released(&self) -> bool {
        self.state.lock().released
    }

    pub fn prepared(&self) -> bool {
        self.state.lock().prepared
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl IsochronousTransport for MockIsoTransport {
    fn transfer_ceiling(&self) -> usize {
        self.state.lock().ceiling
    }

    fn allocate(&mut self, pool: &mut [TransferDescriptor]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return Err(TransportError::Other("insufficient memory".into()));
        }
        state.allocated = pool.len();
        Ok(())
    }

    fn submit(&mut self, descriptor: &mut TransferDescriptor) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(TransportError::Other("submit rejected".into()));
        }
        state.submitted += 1;
        self.queue.lock().push_back((descriptor.slot, false));
        Ok(())
    }

    fn wait_for_completions(
        &mut self,
        pool: &mut [TransferDescriptor],
        completed: &mut Vec<usize>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.queue.lock();

        // Cancelled descriptors come back first, empty
        while !state.hold_cancelled {
            let Some(pos) = queue.iter().position(|&(_, cancelled)| cancelled) else {
                break;
            };
            if let Some((slot, _)) = queue.remove(pos) {
                completed.push(slot);
            }
        }
        if !completed.is_empty() {
            return Ok(());
        }

        let exhausted = state.completion_limit.is_some_and(|limit| state.completed >= limit);
        let pending = queue.iter().any(|&(_, cancelled)| !cancelled);
        if !pending || exhausted {
            drop(queue);
            drop(state);
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(());
        }

        let pacing = state.pacing;
        for _ in 0..state.completions_per_wait {
            if state.completion_limit.is_some_and(|limit| state.completed >= limit) {
                break;
            }
            let Some((slot, _)) = queue
                .iter()
                .position(|&(_, cancelled)| !cancelled)
                .and_then(|pos| queue.remove(pos))
            else {
                break;
            };
            let descriptor = &mut pool[slot];
            for index in 0..descriptor.packets.len() {
                let requested = descriptor.packets[index].requested;
                let (actual, status) = state
                    .overrides
                    .pop_front()
                    .unwrap_or((requested, PacketStatus::Completed));
                let offset = descriptor.packets[index].offset;
                let fill = actual.min(requested);
                for (i, byte) in descriptor.buffer[offset..offset + fill].iter_mut().enumerate() {
                    *byte = state.pattern[i % state.pattern.len()];
                }
                descriptor.packets[index].actual = actual;
                descriptor.packets[index].status = status;
            }
            state.completed += 1;
            completed.push(slot);
        }
        drop(queue);
        drop(state);
        thread::sleep(pacing);
        Ok(())
    }

    fn cancel(&mut self, descriptor: &TransferDescriptor) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let mut queue = self.queue.lock();
        if let Some(entry) = queue.iter_mut().find(|(slot, _)| *slot == descriptor.slot) {
            entry.1 = true;
            state.cancelled += 1;
        }
        Ok(())
    }

    fn release(&mut self, pool: &mut [TransferDescriptor]) {
        let mut state = self.state.lock();
        state.released = true;
        let mut queue = self.queue.lock();
        if !state.hold_cancelled {
            queue.clear();
        }
        for descriptor in pool.iter_mut() {
            if !queue.iter().any(|&(slot, _)| slot == descriptor.slot) {
                descriptor.mark_ready();
            }
        }
    }

    fn prepare_acquisition_thread(&mut self) {
        self.state.lock().prepared = true;
    }
}

/// In-memory sink that stays inspectable after a writer takes ownership.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().get_ref().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.lock().seek(pos)
    }
}
