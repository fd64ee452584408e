use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::audio_models::{CaptureDiagnostics, DeviceFormat};
use crate::models::config::CaptureConfiguration;
use crate::models::error::{CaptureError, TransportError};
use crate::processing::ring_buffer::RingProducer;
use crate::traits::usb_transport::{IsochronousTransport, PacketStatus, TransferDescriptor};

/// Longest single blocking wait, so stop requests are noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// How device packets are grouped into transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferGeometry {
    pub packet_size: usize,
    pub packets_per_transfer: usize,
}

impl TransferGeometry {
    /// Fit as many whole packets under `transfer_ceiling` as allowed.
    ///
    /// Fails when not even one packet fits; capture is never truncated to
    /// make a packet fit.
    pub fn compute(
        packet_size: usize,
        transfer_ceiling: usize,
        max_packets_per_transfer: usize,
    ) -> Result<Self, CaptureError> {
        if packet_size == 0 {
            return Err(CaptureError::ConfigurationFailed(
                "endpoint reports a zero packet size".into(),
            ));
        }
        let packets_per_transfer = max_packets_per_transfer.min(transfer_ceiling / packet_size);
        if packets_per_transfer == 0 {
            return Err(CaptureError::PacketSizeUnsatisfiable {
                packet_size,
                transfer_ceiling,
            });
        }
        Ok(Self {
            packet_size,
            packets_per_transfer,
        })
    }

    pub fn transfer_bytes(&self) -> usize {
        self.packet_size * self.packets_per_transfer
    }
}

/// Counters updated by the acquisition thread and read by anyone.
#[derive(Debug, Default)]
pub struct TransferStats {
    transfers_reaped: AtomicU64,
    packets_accepted: AtomicU64,
    packets_truncated: AtomicU64,
    packets_errored: AtomicU64,
    packets_malformed: AtomicU64,
    resubmit_failures: AtomicU64,
    bytes_captured: AtomicU64,
}

impl TransferStats {
    /// Copy the engine counters into `diagnostics`.
    pub fn fill(&self, diagnostics: &mut CaptureDiagnostics) {
        diagnostics.transfers_reaped = self.transfers_reaped.load(Ordering::Relaxed);
        diagnostics.packets_accepted = self.packets_accepted.load(Ordering::Relaxed);
        diagnostics.packets_truncated = self.packets_truncated.load(Ordering::Relaxed);
        diagnostics.packets_errored = self.packets_errored.load(Ordering::Relaxed);
        diagnostics.packets_malformed = self.packets_malformed.load(Ordering::Relaxed);
        diagnostics.resubmit_failures = self.resubmit_failures.load(Ordering::Relaxed);
        diagnostics.bytes_captured = self.bytes_captured.load(Ordering::Relaxed);
    }

    pub fn bytes_captured(&self) -> u64 {
        self.bytes_captured.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Engine construction failed. The transport comes back so the caller can retry.
pub struct EngineSetupError<T> {
    pub error: CaptureError,
    pub transport: T,
}

impl<T> fmt::Debug for EngineSetupError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSetupError").field("error", &self.error).finish_non_exhaustive()
    }
}

impl<T> From<EngineSetupError<T>> for CaptureError {
    fn from(setup: EngineSetupError<T>) -> Self {
        setup.error
    }
}

/// Keeps a fixed pool of isochronous IN transfers queued against the endpoint.
///
/// All buffers are allocated in [`new`](Self::new); the steady-state loop
/// (`drain_into`) does not allocate, lock or log per packet.
pub struct IsochronousTransferEngine<T: IsochronousTransport> {
    transport: T,
    geometry: TransferGeometry,
    frame_bytes: usize,
    pool: Vec<TransferDescriptor>,
    completed: Vec<usize>,
    in_flight: usize,
    next_sequence: u64,
    running: bool,
    completion_timeout: Duration,
    drain_timeout: Duration,
    last_completion: Instant,
    stats: Arc<TransferStats>,
}

impl<T: IsochronousTransport> IsochronousTransferEngine<T> {
    pub fn new(
        mut transport: T,
        format: &DeviceFormat,
        config: &CaptureConfiguration,
    ) -> Result<Self, EngineSetupError<T>> {
        let ceiling = config.transfer_ceiling.unwrap_or_else(|| transport.transfer_ceiling());
        let geometry = match TransferGeometry::compute(format.max_packet_size, ceiling, config.max_packets_per_transfer)
        {
            Ok(geometry) => geometry,
            Err(error) => return Err(EngineSetupError { error, transport }),
        };

        let mut pool: Vec<TransferDescriptor> = (0..config.transfers_in_flight)
            .map(|slot| TransferDescriptor::new(slot, geometry.packet_size, geometry.packets_per_transfer))
            .collect();
        if let Err(e) = transport.allocate(&mut pool) {
            // Frees whatever part of the pool was allocated
            transport.release(&mut pool);
            let error = match e {
                TransportError::Disconnected => CaptureError::DeviceDisconnected,
                other => CaptureError::DeviceRejected(format!("allocate transfers: {other}")),
            };
            return Err(EngineSetupError { error, transport });
        }

        log::info!(
            "Transfer geometry: {} × {} byte packets per transfer ({} bytes, ceiling {}), {} in flight",
            geometry.packets_per_transfer,
            geometry.packet_size,
            geometry.transfer_bytes(),
            ceiling,
            pool.len()
        );

        Ok(Self {
            transport,
            geometry,
            frame_bytes: format.frame_bytes().max(1),
            completed: Vec::with_capacity(pool.len()),
            pool,
            in_flight: 0,
            next_sequence: 0,
            running: false,
            completion_timeout: config.completion_timeout(),
            drain_timeout: config.drain_timeout(),
            last_completion: Instant::now(),
            stats: Arc::new(TransferStats::default()),
        })
    }

    pub fn geometry(&self) -> TransferGeometry {
        self.geometry
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Prepare the calling thread and queue every descriptor.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.running {
            return Ok(());
        }
        self.transport.prepare_acquisition_thread();
        self.running = true;
        self.last_completion = Instant::now();
        self.resubmit_ready()?;
        if self.in_flight == 0 {
            self.running = false;
            return Err(CaptureError::TransferStarvation);
        }
        log::debug!("Isochronous engine started with {} transfers queued", self.in_flight);
        Ok(())
    }

    /// Reap completed transfers, push their audio into `ring` and resubmit them.
    ///
    /// Returns the bytes captured during this call. Blocks for at most a short
    /// slice when nothing has completed.
    pub fn drain_into(&mut self, ring: &mut RingProducer) -> Result<usize, CaptureError> {
        if !self.running {
            return Ok(0);
        }

        // Descriptors left ready by an earlier submit failure
        if self.in_flight < self.pool.len() {
            self.resubmit_ready()?;
        }

        self.completed.clear();
        let wait = self.completion_timeout.min(WAIT_SLICE);
        match self.transport.wait_for_completions(&mut self.pool, &mut self.completed, wait) {
            Ok(()) | Err(TransportError::Timeout) => {}
            Err(e) => return Err(stream_error(e)),
        }

        if self.completed.is_empty() {
            if self.last_completion.elapsed() >= self.completion_timeout {
                log::error!("No isochronous completion within {:?}", self.completion_timeout);
                return Err(CaptureError::TransferStarvation);
            }
            return Ok(0);
        }
        self.last_completion = Instant::now();

        let reaped = self.reap_completed(ring);
        if self.in_flight == 0 {
            log::error!("Isochronous queue ran dry before resubmission");
            return Err(CaptureError::TransferStarvation);
        }

        for i in 0..self.completed.len() {
            let slot = self.completed[i];
            self.submit_slot(slot)?;
        }
        Ok(reaped)
    }

    /// Cancel everything in flight and collect what completes before the drain timeout.
    ///
    /// Returns the bytes captured while draining.
    pub fn stop(&mut self, ring: &mut RingProducer) -> usize {
        if !self.running {
            return 0;
        }
        self.running = false;

        for descriptor in self.pool.iter().filter(|d| d.is_in_flight()) {
            if let Err(e) = self.transport.cancel(descriptor) {
                log::debug!("Cancel of transfer {} failed: {}", descriptor.slot, e);
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut captured = 0;
        while self.in_flight > 0 && Instant::now() < deadline {
            self.completed.clear();
            let wait = deadline.saturating_duration_since(Instant::now()).min(WAIT_SLICE);
            match self.transport.wait_for_completions(&mut self.pool, &mut self.completed, wait) {
                Ok(()) | Err(TransportError::Timeout) => {}
                Err(e) => {
                    log::warn!("Stopped draining transfers: {}", e);
                    break;
                }
            }
            captured += self.reap_completed(ring);
        }

        if self.in_flight > 0 {
            log::warn!(
                "{} transfers still in flight after {:?}",
                self.in_flight,
                self.drain_timeout
            );
        }
        log::debug!("Isochronous engine stopped, {} bytes drained", captured);
        captured
    }

    /// Free native transfers and hand the transport back.
    pub fn into_transport(mut self) -> T {
        self.release_transfers();
        self.transport
    }

    /// Release the pool to the transport. Returns how many buffers were leaked.
    ///
    /// Descriptors the transport leaves in flight may still be written by the
    /// host stack, so their buffers are never freed.
    fn release_transfers(&mut self) -> usize {
        self.transport.release(&mut self.pool);

        let mut leaked = 0;
        for descriptor in self.pool.iter_mut().filter(|d| d.is_in_flight()) {
            mem::forget(mem::take(&mut descriptor.buffer));
            leaked += 1;
        }
        self.in_flight = 0;
        if leaked > 0 {
            log::error!("Leaking {} transfer buffers still owned by the host stack", leaked);
        }
        leaked
    }

    fn reap_completed(&mut self, ring: &mut RingProducer) -> usize {
        let mut captured = 0;
        let mut reaped = 0;
        for i in 0..self.completed.len() {
            let descriptor = &mut self.pool[self.completed[i]];
            if !descriptor.is_in_flight() {
                continue;
            }
            descriptor.mark_ready();
            self.in_flight -= 1;
            reaped += 1;
            captured += drain_descriptor(descriptor, ring, self.frame_bytes, &self.stats);
        }
        TransferStats::bump(&self.stats.transfers_reaped, reaped);
        TransferStats::bump(&self.stats.bytes_captured, captured as u64);
        captured
    }

    fn resubmit_ready(&mut self) -> Result<(), CaptureError> {
        for slot in 0..self.pool.len() {
            if !self.pool[slot].is_in_flight() {
                self.submit_slot(slot)?;
            }
        }
        Ok(())
    }

    fn submit_slot(&mut self, slot: usize) -> Result<(), CaptureError> {
        let descriptor = &mut self.pool[slot];
        if descriptor.is_in_flight() {
            return Ok(());
        }
        self.next_sequence += 1;
        descriptor.mark_in_flight(self.next_sequence);
        match self.transport.submit(descriptor) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(TransportError::Disconnected) => {
                descriptor.mark_ready();
                Err(CaptureError::DeviceDisconnected)
            }
            Err(e) => {
                descriptor.mark_ready();
                TransferStats::bump(&self.stats.resubmit_failures, 1);
                log::warn!("Submit of transfer {} failed: {}", slot, e);
                Ok(())
            }
        }
    }
}

/// Copy every usable packet of `descriptor` into the ring.
fn drain_descriptor(
    descriptor: &TransferDescriptor,
    ring: &mut RingProducer,
    frame_bytes: usize,
    stats: &TransferStats,
) -> usize {
    let mut captured = 0;
    for (index, packet) in descriptor.packets.iter().enumerate() {
        match packet.status {
            PacketStatus::Pending => {}
            PacketStatus::Overflow => TransferStats::bump(&stats.packets_truncated, 1),
            PacketStatus::Error => TransferStats::bump(&stats.packets_errored, 1),
            PacketStatus::Completed if packet.actual > packet.requested => {
                TransferStats::bump(&stats.packets_truncated, 1)
            }
            PacketStatus::Completed if packet.actual % frame_bytes != 0 => {
                TransferStats::bump(&stats.packets_malformed, 1)
            }
            PacketStatus::Completed => {
                if packet.actual > 0 {
                    captured += ring.write(descriptor.packet_data(index));
                    TransferStats::bump(&stats.packets_accepted, 1);
                }
            }
        }
    }
    captured
}

fn stream_error(e: TransportError) -> CaptureError {
    match e {
        TransportError::Disconnected => CaptureError::DeviceDisconnected,
        other => CaptureError::DeviceRejected(format!("isochronous endpoint: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::ring_buffer::CaptureRingBuffer;
    use crate::test_support::MockIsoTransport;

    fn format(packet_size: usize) -> DeviceFormat {
        DeviceFormat {
            requested_rate: 48000,
            effective_rate: 48000,
            channels: 2,
            bit_depth: 16,
            max_packet_size: packet_size,
        }
    }

    fn config(in_flight: usize) -> CaptureConfiguration {
        CaptureConfiguration {
            channels: 2,
            bit_depth: 16,
            transfers_in_flight: in_flight,
            max_packets_per_transfer: 2,
            completion_timeout_ms: 200,
            drain_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn geometry_fits_ceiling() {
        let geometry = TransferGeometry::compute(5104, 23552, 8).unwrap();
        assert_eq!(geometry.packets_per_transfer, 4);
        assert_eq!(geometry.transfer_bytes(), 20416);

        assert_eq!(TransferGeometry::compute(192, 23552, 8).unwrap().packets_per_transfer, 8);
    }

    #[test]
    fn geometry_rejects_oversized_packets() {
        let err = TransferGeometry::compute(5104, 5000, 8).unwrap_err();
        assert_eq!(
            err,
            CaptureError::PacketSizeUnsatisfiable {
                packet_size: 5104,
                transfer_ceiling: 5000
            }
        );
    }

    #[test]
    fn configured_ceiling_overrides_transport() {
        let transport = MockIsoTransport::new(23552, &[1, 2, 3, 4]);
        let config = CaptureConfiguration {
            transfer_ceiling: Some(4000),
            ..config(4)
        };
        let err = IsochronousTransferEngine::new(transport, &format(5104), &config).err().map(|e| e.error);
        assert!(matches!(err, Some(CaptureError::PacketSizeUnsatisfiable { .. })));
    }

    #[test]
    fn steady_state_moves_packets_into_ring() {
        let transport = MockIsoTransport::new(23552, &[1, 2, 3, 4]);
        let (mut producer, mut consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport.clone(), &format(16), &config(4)).unwrap();

        engine.start().unwrap();
        assert!(transport.prepared());
        assert_eq!(engine.in_flight(), 4);

        let mut captured = 0;
        for _ in 0..10 {
            captured += engine.drain_into(&mut producer).unwrap();
        }

        // One descriptor of two 16-byte packets per wait
        assert_eq!(captured, 10 * 32);
        assert_eq!(engine.in_flight(), 4);
        assert_eq!(transport.submitted(), 14);
        let data = consumer.read(captured);
        assert!(data.chunks(4).all(|frame| frame == [1, 2, 3, 4]));

        let stats = engine.stats();
        let mut diagnostics = CaptureDiagnostics::default();
        stats.fill(&mut diagnostics);
        assert_eq!(diagnostics.transfers_reaped, 10);
        assert_eq!(diagnostics.packets_accepted, 20);
        assert_eq!(diagnostics.bytes_captured, 320);
    }

    #[test]
    fn bad_packets_are_counted_and_skipped() {
        let transport = MockIsoTransport::new(23552, &[9; 4]);
        transport.override_packets(&[
            (16, PacketStatus::Overflow),
            (16, PacketStatus::Error),
            (6, PacketStatus::Completed),
            (8, PacketStatus::Completed),
        ]);
        let (mut producer, consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport, &format(16), &config(4)).unwrap();
        engine.start().unwrap();

        let first = engine.drain_into(&mut producer).unwrap();
        let second = engine.drain_into(&mut producer).unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 8);
        assert_eq!(consumer.available_to_read(), 8);

        let mut diagnostics = CaptureDiagnostics::default();
        engine.stats().fill(&mut diagnostics);
        assert_eq!(diagnostics.packets_truncated, 1);
        assert_eq!(diagnostics.packets_errored, 1);
        assert_eq!(diagnostics.packets_malformed, 1);
        assert_eq!(diagnostics.packets_accepted, 1);
    }

    #[test]
    fn queue_running_dry_is_starvation() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        transport.set_completions_per_wait(2);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport, &format(16), &config(2)).unwrap();
        engine.start().unwrap();

        let err = engine.drain_into(&mut producer).unwrap_err();
        assert_eq!(err, CaptureError::TransferStarvation);
    }

    #[test]
    fn silence_from_endpoint_is_starvation() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        transport.stop_completing_after(0);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport, &format(16), &config(4)).unwrap();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let result = loop {
            match engine.drain_into(&mut producer) {
                Ok(_) if Instant::now() < deadline => continue,
                other => break other,
            }
        };
        assert_eq!(result, Err(CaptureError::TransferStarvation));
    }

    #[test]
    fn failed_resubmits_are_retried() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport.clone(), &format(16), &config(4)).unwrap();
        engine.start().unwrap();

        transport.fail_next_submits(1);
        engine.drain_into(&mut producer).unwrap();
        assert_eq!(engine.in_flight(), 3);

        engine.drain_into(&mut producer).unwrap();
        assert_eq!(engine.in_flight(), 4);

        let mut diagnostics = CaptureDiagnostics::default();
        engine.stats().fill(&mut diagnostics);
        assert_eq!(diagnostics.resubmit_failures, 1);
    }

    #[test]
    fn disconnect_is_reported() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport.clone(), &format(16), &config(4)).unwrap();
        engine.start().unwrap();

        transport.disconnect();
        assert_eq!(engine.drain_into(&mut producer), Err(CaptureError::DeviceDisconnected));
    }

    #[test]
    fn stop_cancels_and_drains_every_descriptor() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport.clone(), &format(16), &config(4)).unwrap();
        engine.start().unwrap();
        engine.drain_into(&mut producer).unwrap();

        engine.stop(&mut producer);

        assert_eq!(engine.in_flight(), 0);
        assert_eq!(transport.cancelled(), 4);
        assert_eq!(transport.queued(), 0);
        assert!(!engine.is_running());

        engine.into_transport();
        assert!(transport.released());
        assert_eq!(transport.allocated(), 4);
    }

    #[test]
    fn allocation_failure_returns_transport() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        transport.fail_next_allocations(1);

        let setup = match IsochronousTransferEngine::new(transport.clone(), &format(16), &config(4)) {
            Err(setup) => setup,
            Ok(_) => panic!("allocation should fail"),
        };
        assert!(matches!(setup.error, CaptureError::DeviceRejected(_)));
        assert!(transport.released());

        let engine = IsochronousTransferEngine::new(setup.transport, &format(16), &config(4)).unwrap();
        assert_eq!(engine.geometry().packets_per_transfer, 2);
        assert_eq!(transport.allocated(), 4);
    }

    #[test]
    fn buffers_still_owned_by_host_are_leaked_not_freed() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        transport.hold_cancelled();
        let config = CaptureConfiguration {
            drain_timeout_ms: 20,
            ..config(4)
        };
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport.clone(), &format(16), &config).unwrap();
        engine.start().unwrap();

        engine.stop(&mut producer);
        assert_eq!(engine.in_flight(), 4);

        assert_eq!(engine.release_transfers(), 4);
        assert!(transport.released());
        assert!(engine.pool.iter().all(|d| d.buffer.is_empty()));
    }

    #[test]
    fn reclaimed_buffers_are_kept() {
        let transport = MockIsoTransport::new(23552, &[0; 4]);
        let (mut producer, _consumer) = CaptureRingBuffer::new(4096, 4);
        let mut engine = IsochronousTransferEngine::new(transport, &format(16), &config(4)).unwrap();
        engine.start().unwrap();
        engine.stop(&mut producer);

        assert_eq!(engine.release_transfers(), 0);
        assert!(engine.pool.iter().all(|d| d.buffer.len() == 32));
    }
}
