use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio_models::{CaptureDiagnostics, DeviceFormat, NegotiationWarning, RateNegotiation};
use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::recording_result::{RecordingMetadata, RecordingResult};
use crate::models::state::RecorderState;
use crate::processing::gain_stage::GainAndClipStage;
use crate::processing::ring_buffer::{CaptureRingBuffer, RingConsumer, RingProducer};
use crate::processing::wav_format::PcmFormat;
use crate::storage::container_writer::{ContainerWriter, RecordingTarget};
use crate::storage::metadata;
use crate::traits::recorder_control::RecorderControl;
use crate::traits::recorder_delegate::RecorderDelegate;
use crate::traits::usb_transport::{ControlTransport, IsochronousTransport};
use crate::usb::protocol::DeviceProtocolController;
use crate::usb::transfer_engine::{IsochronousTransferEngine, TransferGeometry, TransferStats};

/// Bytes the persistence thread moves per ring read.
const PERSISTENCE_CHUNK: usize = 64 * 1024;

/// Internal mutable session state, protected by `parking_lot::Mutex`.
struct SessionState {
    state: RecorderState,
    last_recording: Option<RecordingResult>,
}

/// Writer attached to the stream while recording.
struct ActiveRecording {
    writer: ContainerWriter,
    format: DeviceFormat,
}

/// Shared by the host and both worker threads for one streaming run.
struct StreamShared {
    session_state: Arc<Mutex<SessionState>>,
    writer: Arc<Mutex<Option<ActiveRecording>>>,
    gain: Arc<GainAndClipStage>,
    delegate: Option<Arc<dyn RecorderDelegate>>,
    ring: Arc<CaptureRingBuffer>,
    stats: Arc<TransferStats>,
    bytes_written: AtomicU64,
    stop_acquisition: AtomicBool,
    stop_persistence: AtomicBool,
    faulted: AtomicBool,
    fault: Mutex<Option<CaptureError>>,
}

struct Workers<T> {
    stream: Arc<StreamShared>,
    acquisition: JoinHandle<Option<T>>,
    persistence: JoinHandle<Result<Option<RecordingResult>, CaptureError>>,
}

/// One capture session against a claimed USB audio function.
///
/// Owns the protocol controller and, while idle, the isochronous transport.
/// Streaming runs on two threads:
///
/// ```text
/// [uac-acquisition] engine.drain_into ─→ CaptureRingBuffer ─→ [uac-persistence]
///                                                              gain.process
///                                                              writer.append_frames (recording only)
/// ```
///
/// Faults on either thread close any open container, move the session to
/// idle and are reported to the delegate. The finished threads are joined on
/// the next host call.
pub struct RecorderSession<C: ControlTransport, T: IsochronousTransport + 'static> {
    config: CaptureConfiguration,
    controller: DeviceProtocolController<C>,
    iso_transport: Option<T>,
    session_state: Arc<Mutex<SessionState>>,
    writer: Arc<Mutex<Option<ActiveRecording>>>,
    gain: Arc<GainAndClipStage>,
    delegate: Option<Arc<dyn RecorderDelegate>>,
    workers: Option<Workers<T>>,
    last_stream: Option<Arc<StreamShared>>,
}

impl<C: ControlTransport, T: IsochronousTransport + 'static> RecorderSession<C, T> {
    pub fn new(control: C, iso_transport: T, config: CaptureConfiguration) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        Ok(Self {
            controller: DeviceProtocolController::new(control, &config),
            gain: Arc::new(GainAndClipStage::new(config.bit_depth)),
            config,
            iso_transport: Some(iso_transport),
            session_state: Arc::new(Mutex::new(SessionState {
                state: RecorderState::Idle,
                last_recording: None,
            })),
            writer: Arc::new(Mutex::new(None)),
            delegate: None,
            workers: None,
            last_stream: None,
        })
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn RecorderDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn config(&self) -> &CaptureConfiguration {
        &self.config
    }

    /// Last successfully negotiated format.
    pub fn format(&self) -> Option<DeviceFormat> {
        self.controller.format()
    }

    fn current_state(&self) -> RecorderState {
        self.session_state.lock().state
    }

    fn require_state(&self, expected: RecorderState, operation: &'static str) -> Result<(), CaptureError> {
        let from = self.current_state();
        if from != expected {
            return Err(CaptureError::InvalidStateTransition { from, operation });
        }
        Ok(())
    }

    fn set_state(&self, new_state: RecorderState) {
        let changed = {
            let mut state = self.session_state.lock();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            log::info!("Recorder state → {}", new_state);
            if let Some(ref delegate) = self.delegate {
                delegate.on_state_changed(new_state);
            }
        }
    }

    fn report(&self, error: &CaptureError) {
        if let Some(ref delegate) = self.delegate {
            delegate.on_error(error);
        }
    }

    /// Join threads that ended on their own after a fault.
    fn reap_finished_stream(&mut self) {
        let faulted = self
            .workers
            .as_ref()
            .is_some_and(|w| w.stream.faulted.load(Ordering::Acquire));
        if faulted {
            if let Err(e) = self.shutdown_stream() {
                log::warn!("Stream ended with: {}", e);
            }
        }
    }

    fn spawn_stream(&mut self, format: DeviceFormat) -> Result<(), CaptureError> {
        let transport = self.iso_transport.take().ok_or(CaptureError::DeviceNotAvailable)?;

        let ceiling = self
            .config
            .transfer_ceiling
            .unwrap_or_else(|| transport.transfer_ceiling());
        if let Err(e) =
            TransferGeometry::compute(format.max_packet_size, ceiling, self.config.max_packets_per_transfer)
        {
            self.iso_transport = Some(transport);
            return Err(e);
        }

        if let Err(e) = self.controller.set_streaming(true) {
            self.iso_transport = Some(transport);
            return Err(e);
        }

        let engine = match IsochronousTransferEngine::new(transport, &format, &self.config) {
            Ok(engine) => engine,
            Err(setup) => {
                self.iso_transport = Some(setup.transport);
                return Err(setup.error);
            }
        };
        let geometry = engine.geometry();

        let wanted = (format.bytes_per_second() as f64 * self.config.ring_buffer_secs) as usize;
        let floor = geometry.transfer_bytes() * self.config.transfers_in_flight * 2;
        let (producer, consumer) = CaptureRingBuffer::new(wanted.max(floor), format.frame_bytes());

        let stream = Arc::new(StreamShared {
            session_state: self.session_state.clone(),
            writer: self.writer.clone(),
            gain: self.gain.clone(),
            delegate: self.delegate.clone(),
            ring: producer.ring(),
            stats: engine.stats(),
            bytes_written: AtomicU64::new(0),
            stop_acquisition: AtomicBool::new(false),
            stop_persistence: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            fault: Mutex::new(None),
        });

        let chunk = (PERSISTENCE_CHUNK / format.frame_bytes()).max(1) * format.frame_bytes();
        let poll = self.config.persistence_poll();
        let level_interval = self.config.level_interval();
        let persistence_stream = stream.clone();
        let persistence = match thread::Builder::new()
            .name("uac-persistence".into())
            .spawn(move || run_persistence(persistence_stream, consumer, chunk, poll, level_interval))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.iso_transport = Some(engine.into_transport());
                return Err(CaptureError::ConfigurationFailed(format!(
                    "failed to spawn persistence thread: {}",
                    e
                )));
            }
        };

        // The engine only moves to the thread once it exists
        let (handoff_tx, handoff_rx) = mpsc::channel::<(IsochronousTransferEngine<T>, RingProducer)>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let acquisition_stream = stream.clone();
        let spawned = thread::Builder::new().name("uac-acquisition".into()).spawn(move || {
            let (engine, producer) = handoff_rx.recv().ok()?;
            Some(run_acquisition(engine, producer, acquisition_stream, ready_tx))
        });
        let handoff = match spawned {
            Ok(handle) => handoff_tx.send((engine, producer)).map(|()| handle),
            Err(e) => {
                stream.stop_persistence.store(true, Ordering::Release);
                let _ = persistence.join();
                self.iso_transport = Some(engine.into_transport());
                return Err(CaptureError::ConfigurationFailed(format!(
                    "failed to spawn acquisition thread: {}",
                    e
                )));
            }
        };
        let acquisition = match handoff {
            Ok(handle) => handle,
            Err(mpsc::SendError((engine, _))) => {
                stream.stop_persistence.store(true, Ordering::Release);
                let _ = persistence.join();
                self.iso_transport = Some(engine.into_transport());
                return Err(CaptureError::DeviceRejected("acquisition thread exited".into()));
            }
        };

        self.workers = Some(Workers {
            stream,
            acquisition,
            persistence,
        });

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::DeviceRejected("acquisition thread exited".into())));
        if let Err(e) = started {
            let _ = self.shutdown_stream();
            return Err(e);
        }
        Ok(())
    }

    /// Stop acquisition, drain the ring, close any writer and join both threads.
    fn shutdown_stream(&mut self) -> Result<Option<RecordingResult>, CaptureError> {
        let Some(workers) = self.workers.take() else {
            return Ok(None);
        };

        workers.stream.stop_acquisition.store(true, Ordering::Release);
        match workers.acquisition.join() {
            Ok(Some(transport)) => self.iso_transport = Some(transport),
            Ok(None) => log::error!("Acquisition thread never received the engine; transport lost"),
            Err(_) => log::error!("Acquisition thread panicked; transport lost"),
        }

        workers.stream.stop_persistence.store(true, Ordering::Release);
        let outcome = workers
            .persistence
            .join()
            .unwrap_or_else(|_| Err(CaptureError::StorageError("persistence thread panicked".into())));

        if let Err(e) = self.controller.set_streaming(false) {
            log::warn!("Failed to disable streaming interface: {}", e);
        }

        let diagnostics = workers.stream.diagnostics();
        log::info!(
            "Stream stopped: {} bytes captured, {} packets lost, {} ring overruns",
            diagnostics.bytes_captured,
            diagnostics.packets_lost(),
            diagnostics.ring_overruns
        );
        self.last_stream = Some(workers.stream);
        outcome
    }
}

impl<C: ControlTransport, T: IsochronousTransport + 'static> RecorderControl for RecorderSession<C, T> {
    fn state(&self) -> RecorderState {
        self.current_state()
    }

    fn negotiate_format(&mut self, requested_rate: u32) -> Result<RateNegotiation, CaptureError> {
        self.reap_finished_stream();
        self.require_state(RecorderState::Idle, "negotiate format")?;

        let last_good = self.controller.format();
        let error = match self.controller.negotiate_format(requested_rate) {
            Ok(negotiation) => return Ok(negotiation),
            Err(e) => e,
        };

        let recoverable = matches!(
            error,
            CaptureError::DeviceUnresponsive(_) | CaptureError::DeviceRejected(_)
        );
        let previous = match last_good {
            Some(previous) if recoverable => previous,
            _ => {
                self.report(&error);
                return Err(error);
            }
        };

        log::warn!(
            "Negotiation of {} Hz failed ({}), restoring {} Hz",
            requested_rate,
            error,
            previous.effective_rate
        );
        match self.controller.restore_format(previous) {
            Ok(format) => Ok(RateNegotiation {
                requested_rate,
                effective_rate: format.effective_rate,
                format,
                warning: Some(NegotiationWarning::FellBackToLastGood {
                    reason: error.to_string(),
                }),
            }),
            Err(restore_error) => {
                let message = format!(
                    "{}; restoring {} Hz failed: {}",
                    error, previous.effective_rate, restore_error
                );
                let e = match restore_error {
                    CaptureError::DeviceDisconnected => CaptureError::DeviceDisconnected,
                    CaptureError::DeviceUnresponsive(_) => CaptureError::DeviceUnresponsive(message),
                    _ => CaptureError::DeviceRejected(message),
                };
                self.report(&e);
                Err(e)
            }
        }
    }

    fn supported_sample_rates(&mut self) -> Result<Vec<u32>, CaptureError> {
        self.controller.supported_sample_rates()
    }

    fn effective_sample_rate(&self) -> Option<u32> {
        self.controller.format().map(|f| f.effective_rate)
    }

    fn start_monitoring(&mut self, gain_db: f32) -> Result<(), CaptureError> {
        self.reap_finished_stream();
        self.require_state(RecorderState::Idle, "start monitoring")?;

        let format = match self.controller.format() {
            Some(format) => format,
            None => self.negotiate_format(self.config.sample_rate)?.format,
        };
        self.gain.set_gain_db(gain_db)?;

        // Claimed before the threads exist so a fault can only move it back to idle
        self.session_state.lock().state = RecorderState::Monitoring;
        if let Err(e) = self.spawn_stream(format) {
            self.session_state.lock().state = RecorderState::Idle;
            if let Err(disable) = self.controller.set_streaming(false) {
                log::warn!("Failed to disable streaming interface: {}", disable);
            }
            self.report(&e);
            return Err(e);
        }

        if self.current_state() == RecorderState::Monitoring {
            log::info!("Recorder state → {}", RecorderState::Monitoring);
            if let Some(ref delegate) = self.delegate {
                delegate.on_state_changed(RecorderState::Monitoring);
            }
        }
        Ok(())
    }

    fn start_recording(&mut self, target: RecordingTarget) -> Result<(), CaptureError> {
        self.reap_finished_stream();
        self.require_state(RecorderState::Monitoring, "start recording")?;

        let format = self.controller.format().ok_or(CaptureError::DeviceNotAvailable)?;
        let writer = match ContainerWriter::open(target, PcmFormat::from(&format)) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("Failed to open recording target: {}", e);
                self.report(&e);
                return Err(e);
            }
        };

        {
            let mut state = self.session_state.lock();
            if state.state != RecorderState::Monitoring {
                let from = state.state;
                drop(state);
                writer.abandon();
                return Err(CaptureError::InvalidStateTransition {
                    from,
                    operation: "start recording",
                });
            }
            if let Some(ref workers) = self.workers {
                workers.stream.bytes_written.store(0, Ordering::Relaxed);
            }
            *self.writer.lock() = Some(ActiveRecording { writer, format });
            state.state = RecorderState::Recording;
        }

        log::info!("Recorder state → {}", RecorderState::Recording);
        if let Some(ref delegate) = self.delegate {
            delegate.on_state_changed(RecorderState::Recording);
        }
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<RecordingResult, CaptureError> {
        self.reap_finished_stream();
        self.require_state(RecorderState::Recording, "stop recording")?;

        let outcome = self.shutdown_stream();
        self.set_state(RecorderState::Idle);

        match outcome {
            Ok(Some(result)) => Ok(result),
            Ok(None) => self
                .session_state
                .lock()
                .last_recording
                .clone()
                .ok_or_else(|| CaptureError::StorageError("recording was closed without a result".into())),
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    fn stop_monitoring(&mut self) -> Result<(), CaptureError> {
        self.reap_finished_stream();
        self.require_state(RecorderState::Monitoring, "stop monitoring")?;

        let outcome = self.shutdown_stream();
        self.set_state(RecorderState::Idle);
        outcome.map(|_| ())
    }

    fn stop(&mut self) -> Result<Option<RecordingResult>, CaptureError> {
        self.reap_finished_stream();
        match self.current_state() {
            RecorderState::Recording => self.stop_recording().map(Some),
            RecorderState::Monitoring => self.stop_monitoring().map(|_| None),
            from @ RecorderState::Idle => Err(CaptureError::InvalidStateTransition { from, operation: "stop" }),
        }
    }

    fn set_gain_db(&self, gain_db: f32) -> Result<f32, CaptureError> {
        self.gain.set_gain_db(gain_db)
    }

    fn peak_level(&self) -> f32 {
        self.gain.peak_level()
    }

    fn has_clipped(&self) -> bool {
        self.gain.has_clipped()
    }

    fn reset_clip(&self) {
        self.gain.reset_clip();
    }

    fn diagnostics(&self) -> CaptureDiagnostics {
        self.workers
            .as_ref()
            .map(|w| &w.stream)
            .or(self.last_stream.as_ref())
            .map(|stream| stream.diagnostics())
            .unwrap_or_default()
    }

    fn last_recording(&self) -> Option<RecordingResult> {
        self.session_state.lock().last_recording.clone()
    }
}

impl<C: ControlTransport, T: IsochronousTransport + 'static> Drop for RecorderSession<C, T> {
    fn drop(&mut self) {
        if self.workers.is_some() {
            log::warn!("Recorder session dropped while streaming, stopping");
            if let Err(e) = self.shutdown_stream() {
                log::error!("Failed to stop stream cleanly: {}", e);
            }
        }
    }
}

impl StreamShared {
    /// Record the first fault and ask the acquisition thread to stop.
    fn raise_fault(&self, error: CaptureError) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                log::error!("Capture fault: {}", error);
                *fault = Some(error);
            }
        }
        self.stop_acquisition.store(true, Ordering::Release);
        self.faulted.store(true, Ordering::Release);
    }

    fn append(&self, frames: &[u8]) -> Result<(), CaptureError> {
        let mut slot = self.writer.lock();
        if let Some(active) = slot.as_mut() {
            active.writer.append_frames(frames)?;
            self.bytes_written.fetch_add(frames.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn diagnostics(&self) -> CaptureDiagnostics {
        let mut diagnostics = CaptureDiagnostics::default();
        self.stats.fill(&mut diagnostics);
        diagnostics.ring_overruns = self.ring.overrun_count();
        diagnostics.ring_dropped_bytes = self.ring.dropped_bytes();
        diagnostics.bytes_written = self.bytes_written.load(Ordering::Relaxed);
        diagnostics
    }

    /// Finalize `active`, write its sidecar and publish the result.
    fn close_recording(&self, active: ActiveRecording) -> Result<RecordingResult, CaptureError> {
        let diagnostics = self.diagnostics();
        let summary = active.writer.close()?;

        let metadata = RecordingMetadata::new(
            &active.format,
            summary.frames,
            summary.data_bytes,
            summary.rf64,
            summary.file_path.as_deref().and_then(|p| p.to_str()),
            summary.checksum.as_deref(),
            diagnostics,
        );
        if let Some(ref path) = summary.file_path {
            if let Err(e) = metadata::write_metadata(&metadata, path) {
                log::warn!("Recording saved without metadata sidecar: {}", e);
            }
        }

        let result = RecordingResult {
            file_path: summary.file_path.clone(),
            duration_secs: summary.duration_secs(),
            metadata,
            checksum: summary.checksum,
        };
        self.session_state.lock().last_recording = Some(result.clone());
        if let Some(ref delegate) = self.delegate {
            delegate.on_recording_finished(&result);
        }
        Ok(result)
    }

    /// Fault path: close the container as-is, go idle, tell the delegate.
    fn abort(&self, fault: CaptureError) -> Result<Option<RecordingResult>, CaptureError> {
        self.stop_acquisition.store(true, Ordering::Release);
        let active = {
            let mut state = self.session_state.lock();
            state.state = RecorderState::Idle;
            self.writer.lock().take()
        };

        if let Some(ref delegate) = self.delegate {
            delegate.on_error(&fault);
        }
        let closed = active.map(|active| self.close_recording(active)).transpose();
        if let (Err(e), Some(delegate)) = (&closed, &self.delegate) {
            delegate.on_error(e);
        }

        log::info!("Recorder state → {}", RecorderState::Idle);
        if let Some(ref delegate) = self.delegate {
            delegate.on_state_changed(RecorderState::Idle);
        }
        closed
    }
}

fn run_acquisition<T: IsochronousTransport>(
    mut engine: IsochronousTransferEngine<T>,
    mut producer: RingProducer,
    stream: Arc<StreamShared>,
    ready: mpsc::Sender<Result<(), CaptureError>>,
) -> T {
    if let Err(e) = engine.start() {
        let _ = ready.send(Err(e));
        return engine.into_transport();
    }
    let _ = ready.send(Ok(()));

    while !stream.stop_acquisition.load(Ordering::Acquire) {
        if let Err(e) = engine.drain_into(&mut producer) {
            stream.raise_fault(e);
            break;
        }
    }

    engine.stop(&mut producer);
    engine.into_transport()
}

fn run_persistence(
    stream: Arc<StreamShared>,
    mut consumer: RingConsumer,
    chunk: usize,
    poll: Duration,
    level_interval: Duration,
) -> Result<Option<RecordingResult>, CaptureError> {
    let mut scratch = vec![0u8; chunk];
    let mut last_levels: Option<Instant> = None;

    loop {
        let n = consumer.read_into(&mut scratch);
        if n > 0 {
            let frames = &mut scratch[..n];
            stream.gain.process(frames);
            if let Err(e) = stream.append(frames) {
                stream.raise_fault(e);
            }
            if last_levels.map_or(true, |t| t.elapsed() >= level_interval) {
                if let Some(ref delegate) = stream.delegate {
                    delegate.on_levels_updated(&stream.gain.levels());
                }
                last_levels = Some(Instant::now());
            }
        }

        if stream.faulted.load(Ordering::Acquire) {
            let fault = stream
                .fault
                .lock()
                .clone()
                .unwrap_or(CaptureError::DeviceDisconnected);
            return stream.abort(fault);
        }

        if n == 0 {
            if stream.stop_persistence.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(poll);
        }
    }

    let active = stream.writer.lock().take();
    active.map(|active| stream.close_recording(active)).transpose()
}
