use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::models::audio_models::AudioLevels;
use crate::models::error::CaptureError;

/// Highest gain the stage accepts, in dB.
pub const MAX_GAIN_DB: f32 = 48.0;

/// Integer gain, saturation and peak metering over little-endian signed PCM.
///
/// Shared between the persistence thread (which calls [`process`](Self::process))
/// and the host (gain changes, metering, clip acknowledgement); every field is
/// an atomic so all methods take `&self`.
///
/// The clip flag is latched: once any sample saturates it stays set until
/// [`reset_clip`](Self::reset_clip), regardless of later clean input.
#[derive(Debug)]
pub struct GainAndClipStage {
    bit_depth: u16,
    gain_db: AtomicU32,
    linear: AtomicU64,
    clipped: AtomicBool,
    peak: AtomicU32,
}

impl GainAndClipStage {
    pub fn new(bit_depth: u16) -> Self {
        debug_assert!(matches!(bit_depth, 16 | 24 | 32));
        Self {
            bit_depth,
            gain_db: AtomicU32::new(0.0f32.to_bits()),
            linear: AtomicU64::new(1.0f64.to_bits()),
            clipped: AtomicBool::new(false),
            peak: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    /// Set the gain in dB. Values outside 0–48 dB are clamped.
    ///
    /// Returns the gain actually applied.
    pub fn set_gain_db(&self, gain_db: f32) -> Result<f32, CaptureError> {
        if !gain_db.is_finite() {
            return Err(CaptureError::ConfigurationFailed(format!("invalid gain: {gain_db}")));
        }
        let applied = gain_db.clamp(0.0, MAX_GAIN_DB);
        if applied != gain_db {
            log::warn!("Gain {gain_db} dB out of range, using {applied} dB");
        }
        let linear = 10f64.powf(applied as f64 / 20.0);
        self.linear.store(linear.to_bits(), Ordering::Relaxed);
        self.gain_db.store(applied.to_bits(), Ordering::Relaxed);
        Ok(applied)
    }

    pub fn gain_db(&self) -> f32 {
        f32::from_bits(self.gain_db.load(Ordering::Relaxed))
    }

    /// Linear multiplier derived from the current gain.
    pub fn linear_gain(&self) -> f64 {
        f64::from_bits(self.linear.load(Ordering::Relaxed))
    }

    /// Apply gain in place to whole samples of `frames`, returning the peak of this call.
    ///
    /// Trailing bytes that do not form a whole sample are left untouched.
    pub fn process(&self, frames: &mut [u8]) -> f32 {
        let linear = self.linear_gain();
        let unity = linear == 1.0;
        let bits = self.bit_depth as u32;
        let max = (1i64 << (bits - 1)) - 1;
        let min = -(1i64 << (bits - 1));
        let bytes_per_sample = self.bit_depth as usize / 8;

        let mut peak_magnitude = 0u64;
        let mut clipped = false;

        for sample in frames.chunks_exact_mut(bytes_per_sample) {
            let value = decode_sample(sample);
            let scaled = if unity {
                value
            } else {
                (value as f64 * linear).round() as i64
            };
            let saturated = if scaled > max {
                clipped = true;
                max
            } else if scaled < min {
                clipped = true;
                min
            } else {
                scaled
            };
            if !unity {
                encode_sample(saturated, sample);
            }
            peak_magnitude = peak_magnitude.max(saturated.unsigned_abs());
        }

        if clipped {
            self.clipped.store(true, Ordering::Relaxed);
        }
        let peak = (peak_magnitude as f64 / (1u64 << (bits - 1)) as f64).min(1.0) as f32;
        self.peak.store(peak.to_bits(), Ordering::Relaxed);
        peak
    }

    /// Peak of the most recent `process` call, 0.0–1.0.
    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }

    pub fn has_clipped(&self) -> bool {
        self.clipped.load(Ordering::Relaxed)
    }

    /// Acknowledge clipping.
    pub fn reset_clip(&self) {
        self.clipped.store(false, Ordering::Relaxed);
    }

    pub fn levels(&self) -> AudioLevels {
        AudioLevels {
            peak: self.peak_level(),
            clipped: self.has_clipped(),
        }
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }
}

fn decode_sample(bytes: &[u8]) -> i64 {
    match bytes.len() {
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        // Sign-extend from bit 23
        3 => (i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8) as i64,
        _ => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    }
}

fn encode_sample(value: i64, out: &mut [u8]) {
    match out.len() {
        2 => out.copy_from_slice(&(value as i16).to_le_bytes()),
        3 => out.copy_from_slice(&(value as i32).to_le_bytes()[..3]),
        _ => out.copy_from_slice(&(value as i32).to_le_bytes()),
    }
}
