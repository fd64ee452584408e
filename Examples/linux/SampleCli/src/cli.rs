//! Command-line arguments.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use uac_capture_core::CaptureConfiguration;

/// Capture audio from a USB Audio Class 2 interface.
#[derive(Debug, Parser)]
#[command(name = "uac-capture", about, version)]
pub struct Cli {
    /// Device as VID:PID in hex, e.g. 1235:8211 (default: first capture device)
    #[arg(long, short = 'd', env = "UAC_CAPTURE_DEVICE", global = true)]
    pub device: Option<String>,

    /// JSON capture configuration; flags override its values
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Requested sample rate in Hz
    #[arg(long, short = 'r', global = true)]
    pub rate: Option<u32>,

    /// Input gain in dB
    #[arg(long, short = 'g', default_value_t = 0.0, allow_hyphen_values = true, global = true)]
    pub gain_db: f32,

    /// Override the host transfer-size ceiling in bytes
    #[arg(long, global = true)]
    pub transfer_ceiling: Option<usize>,

    /// Keep the acquisition thread at normal priority
    #[arg(long, global = true)]
    pub no_realtime: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List attached USB audio capture devices
    List,

    /// Show the sample rates the device clock advertises
    Rates,

    /// Stream without recording and print levels
    Monitor {
        /// Seconds to monitor
        #[arg(long, short = 's', default_value_t = 10.0)]
        seconds: f64,
    },

    /// Record to a WAV file (RF64 past 4 GiB)
    Record {
        /// Output file
        output: PathBuf,

        /// Seconds to record
        #[arg(long, short = 's', default_value_t = 10.0)]
        seconds: f64,
    },

    /// Print the header and sidecar metadata of a recording
    Inspect {
        file: PathBuf,
    },
}

impl Cli {
    /// Configuration file values with flag overrides applied.
    pub fn capture_configuration(&self) -> Result<CaptureConfiguration> {
        let mut config = match &self.config {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => CaptureConfiguration::default(),
        };
        if let Some(rate) = self.rate {
            config.sample_rate = rate;
        }
        if self.transfer_ceiling.is_some() {
            config.transfer_ceiling = self.transfer_ceiling;
        }
        if let Err(msg) = config.validate() {
            bail!("invalid configuration: {msg}");
        }
        Ok(config)
    }

    pub fn device_ids(&self) -> Result<Option<(u16, u16)>> {
        self.device.as_deref().map(parse_device_ids).transpose()
    }
}

/// Parse `VID:PID` in hexadecimal.
pub fn parse_device_ids(text: &str) -> Result<(u16, u16)> {
    let Some((vid, pid)) = text.split_once(':') else {
        bail!("expected VID:PID, got {text:?}");
    };
    let parse = |part: &str| {
        u16::from_str_radix(part.trim_start_matches("0x"), 16).with_context(|| format!("bad id {part:?} in {text:?}"))
    };
    Ok((parse(vid)?, parse(pid)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_hex() {
        assert_eq!(parse_device_ids("1235:8211").unwrap(), (0x1235, 0x8211));
        assert_eq!(parse_device_ids("0x0a12:0x0001").unwrap(), (0x0a12, 0x0001));
        assert!(parse_device_ids("12358211").is_err());
        assert!(parse_device_ids("zz:01").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["uac-capture", "--rate", "96000", "--gain-db", "-6", "monitor"]);
        let config = cli.capture_configuration().unwrap();
        assert_eq!(config.sample_rate, 96000);
        assert_eq!(cli.gain_db, -6.0);
        assert!(matches!(cli.command, Command::Monitor { seconds } if seconds == 10.0));
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let cli = Cli::parse_from(["uac-capture", "--transfer-ceiling", "0", "rates"]);
        assert!(cli.capture_configuration().is_err());
    }
}
