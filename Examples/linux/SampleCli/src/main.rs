mod cli;
mod delegate;

use std::fs::File;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use uac_capture_core::storage::metadata;
use uac_capture_core::{
    CaptureConfiguration, CaptureError, ContainerInfo, NegotiationWarning, RecorderControl, RecorderSession,
    RecorderState, RecordingResult, RecordingTarget,
};
use uac_capture_libusb::{BackendOptions, DeviceEnumerator, LibusbControlTransport, LibusbIsoTransport, UacDevice};

use crate::cli::{Cli, Command};
use crate::delegate::ConsoleDelegate;

type Session = RecorderSession<LibusbControlTransport, LibusbIsoTransport>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match &cli.command {
        Command::List => list_devices(),
        Command::Inspect { file } => inspect(file),
        Command::Rates => {
            let mut session = open_session(&cli)?;
            let rates = session.supported_sample_rates()?;
            if rates.is_empty() {
                println!("device does not report its sample rates");
            }
            for rate in rates {
                println!("{rate}");
            }
            Ok(())
        }
        Command::Monitor { seconds } => {
            let (mut session, delegate) = start(&cli)?;
            run_for(*seconds, &delegate);
            stop_session(&mut session)?;
            print_diagnostics(&session);
            delegate.take_error().map_or(Ok(()), |e| Err(e.into()))
        }
        Command::Record { output, seconds } => {
            let (mut session, delegate) = start(&cli)?;
            session.start_recording(RecordingTarget::path(output))?;
            run_for(*seconds, &delegate);

            let result = stop_session(&mut session)?
                .or_else(|| session.last_recording())
                .ok_or_else(|| anyhow!("recording was not finalized"))?;
            println!("{}", serde_json::to_string_pretty(&result.metadata)?);
            print_diagnostics(&session);
            delegate.take_error().map_or(Ok(()), |e| Err(e.into()))
        }
    }
}

fn list_devices() -> Result<()> {
    let enumerator = DeviceEnumerator::new()?;
    let devices = enumerator.list_capture_devices()?;
    if devices.is_empty() {
        println!("no USB audio capture devices found");
    }
    for info in devices {
        println!(
            "{:04x}:{:04x}  bus {:03} addr {:03}  {}{}",
            info.vendor_id,
            info.product_id,
            info.bus_number,
            info.address,
            info.display_name(),
            if info.uac2 { "" } else { " (UAC1, unsupported)" }
        );
        for ep in &info.endpoints {
            println!(
                "    interface {} alt {}  endpoint {:#04x}  {} bytes/interval",
                ep.streaming_interface, ep.alt_setting, ep.endpoint_address, ep.max_packet_size
            );
        }
        if !info.clock_sources.is_empty() {
            println!("    clock sources: {:02x?}", info.clock_sources);
        }
    }
    Ok(())
}

fn inspect(path: &std::path::Path) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let info = ContainerInfo::read_from(&mut file)?;
    println!(
        "{}  {} Hz  {} ch  {} bit  {} frames  {:.3}s",
        if info.rf64 { "RF64" } else { "RIFF" },
        info.format.sample_rate,
        info.format.channels,
        info.format.bits_per_sample,
        info.frames(),
        info.duration_secs()
    );
    match metadata::read_metadata(path) {
        Ok(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
        Err(e) => log::debug!("no sidecar: {}", e),
    }
    Ok(())
}

fn open_session(cli: &Cli) -> Result<Session> {
    let config = cli.capture_configuration()?;
    let device = open_device(cli, &config)?;
    let options = BackendOptions {
        transfer_ceiling: config.transfer_ceiling.unwrap_or(BackendOptions::default().transfer_ceiling),
        realtime_priority: !cli.no_realtime,
    };
    let (control, iso) = device.into_transports(&options);
    Ok(RecorderSession::new(control, iso, config)?)
}

fn open_device(cli: &Cli, config: &CaptureConfiguration) -> Result<UacDevice> {
    if let Some((vid, pid)) = cli.device_ids()? {
        return Ok(UacDevice::open(vid, pid, &config.interface)?);
    }
    let enumerator = DeviceEnumerator::new()?;
    let first = enumerator
        .list_capture_devices()?
        .into_iter()
        .find(|info| info.uac2)
        .ok_or_else(|| anyhow!("no UAC2 capture device attached"))?;
    log::info!("using {}", first.display_name());
    Ok(UacDevice::open_at(first.bus_number, first.address, &config.interface)?)
}

/// Negotiate the clock and start monitoring.
fn start(cli: &Cli) -> Result<(Session, std::sync::Arc<ConsoleDelegate>)> {
    let mut session = open_session(cli)?;
    let delegate = ConsoleDelegate::new();
    session.set_delegate(delegate.clone());

    let requested = session.config().sample_rate;
    let negotiation = session.negotiate_format(requested)?;
    match &negotiation.warning {
        None => log::info!("clock running at {} Hz", negotiation.effective_rate),
        Some(NegotiationWarning::RateMismatch) => log::warn!(
            "requested {} Hz, device runs at {} Hz",
            requested,
            negotiation.effective_rate
        ),
        Some(NegotiationWarning::RateUnsupported) => log::warn!(
            "{} Hz not advertised; device runs at {} Hz",
            requested,
            negotiation.effective_rate
        ),
        Some(NegotiationWarning::FellBackToLastGood { reason }) => {
            log::warn!("using last good format: {}", reason)
        }
    }

    let applied = session.set_gain_db(cli.gain_db)?;
    if applied != cli.gain_db {
        log::warn!("gain clamped to {:.1} dB", applied);
    }
    session.start_monitoring(applied)?;
    Ok((session, delegate))
}

/// Stop the stream unless a fault already did.
///
/// A faulted session is idle with its recording closed, so `stop` reports an
/// invalid transition; that is not an error here.
fn stop_session<S: RecorderControl>(session: &mut S) -> Result<Option<RecordingResult>> {
    match session.stop() {
        Ok(result) => Ok(result),
        Err(CaptureError::InvalidStateTransition {
            from: RecorderState::Idle,
            ..
        }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn run_for(seconds: f64, delegate: &ConsoleDelegate) {
    if !(seconds.is_finite() && seconds > 0.0) {
        return;
    }
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline {
        if delegate.has_error() {
            log::error!("stream stopped early");
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn print_diagnostics(session: &Session) {
    let d = session.diagnostics();
    log::info!(
        "captured {} bytes, wrote {}, {} packets lost, {} ring overruns",
        d.bytes_captured,
        d.bytes_written,
        d.packets_lost(),
        d.ring_overruns
    );
    if d.ring_overruns > 0 {
        log::warn!("{} bytes dropped by the ring buffer", d.ring_dropped_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uac_capture_core::{CaptureDiagnostics, DeviceFormat, RateNegotiation, RecordingMetadata};

    /// Session whose stream already ended; `stop` fails with `stop_error`.
    struct FaultedSession {
        closed: Option<RecordingResult>,
        stop_error: CaptureError,
    }

    impl FaultedSession {
        fn idle(closed: Option<RecordingResult>) -> Self {
            Self {
                closed,
                stop_error: CaptureError::InvalidStateTransition {
                    from: RecorderState::Idle,
                    operation: "stop",
                },
            }
        }
    }

    impl RecorderControl for FaultedSession {
        fn state(&self) -> RecorderState {
            RecorderState::Idle
        }
        fn negotiate_format(&mut self, _requested_rate: u32) -> Result<RateNegotiation, CaptureError> {
            unimplemented!()
        }
        fn supported_sample_rates(&mut self) -> Result<Vec<u32>, CaptureError> {
            Ok(Vec::new())
        }
        fn effective_sample_rate(&self) -> Option<u32> {
            None
        }
        fn start_monitoring(&mut self, _gain_db: f32) -> Result<(), CaptureError> {
            unimplemented!()
        }
        fn start_recording(&mut self, _target: RecordingTarget) -> Result<(), CaptureError> {
            unimplemented!()
        }
        fn stop_recording(&mut self) -> Result<RecordingResult, CaptureError> {
            unimplemented!()
        }
        fn stop_monitoring(&mut self) -> Result<(), CaptureError> {
            unimplemented!()
        }
        fn stop(&mut self) -> Result<Option<RecordingResult>, CaptureError> {
            Err(self.stop_error.clone())
        }
        fn set_gain_db(&self, gain_db: f32) -> Result<f32, CaptureError> {
            Ok(gain_db)
        }
        fn peak_level(&self) -> f32 {
            0.0
        }
        fn has_clipped(&self) -> bool {
            false
        }
        fn reset_clip(&self) {}
        fn diagnostics(&self) -> CaptureDiagnostics {
            CaptureDiagnostics::default()
        }
        fn last_recording(&self) -> Option<RecordingResult> {
            self.closed.clone()
        }
    }

    fn closed_recording() -> RecordingResult {
        let format = DeviceFormat {
            requested_rate: 48000,
            effective_rate: 48000,
            channels: 2,
            bit_depth: 16,
            max_packet_size: 192,
        };
        let metadata = RecordingMetadata::new(
            &format,
            480,
            1920,
            false,
            Some("take.wav"),
            None,
            CaptureDiagnostics::default(),
        );
        RecordingResult {
            file_path: Some("take.wav".into()),
            duration_secs: 0.01,
            metadata,
            checksum: None,
        }
    }

    #[test]
    fn stopping_a_faulted_session_is_not_an_error() {
        let mut session = FaultedSession::idle(Some(closed_recording()));

        let stopped = stop_session(&mut session).unwrap();
        assert!(stopped.is_none());

        let result = stopped.or_else(|| session.last_recording()).unwrap();
        assert_eq!(result.metadata.frames, 480);
    }

    #[test]
    fn other_stop_failures_still_surface() {
        let mut session = FaultedSession {
            closed: None,
            stop_error: CaptureError::StorageError("disk full".into()),
        };
        assert!(stop_session(&mut session).is_err());

        let mut recording = FaultedSession {
            closed: None,
            stop_error: CaptureError::InvalidStateTransition {
                from: RecorderState::Recording,
                operation: "stop",
            },
        };
        assert!(stop_session(&mut recording).is_err());
    }
}
