//! RIFF/WAVE and RF64 container layout.
//!
//! Headers are written with a 28-byte `JUNK` chunk directly after `WAVE`. It
//! is the same size as a `ds64` body, so a file that outgrows 32-bit sizes can
//! be promoted in place by renaming `RIFF`→`RF64` and `JUNK`→`ds64` without
//! moving any audio (EBU Tech 3306).
//!
//! Layout:
//! ```text
//! [0-3]    "RIFF" | "RF64"
//! [4-7]    file size - 8            (0xFFFFFFFF once RF64)
//! [8-11]   "WAVE"
//! [12-15]  "JUNK" | "ds64"
//! [16-19]  28
//! [20-27]  ds64: RIFF size (u64)
//! [28-35]  ds64: data size (u64)
//! [36-43]  ds64: sample count (u64)
//! [44-47]  ds64: table length (0)
//! [48-51]  "fmt "
//! [52-55]  16 (PCM) | 40 (WAVE_FORMAT_EXTENSIBLE)
//! [56-..]  format body
//! [..]     "data", data size (0xFFFFFFFF once RF64), payload
//! ```

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::models::audio_models::DeviceFormat;
use crate::models::error::CaptureError;

/// Value written to 32-bit size fields once the `ds64` chunk is authoritative.
pub const SIZE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Offset of the reserved `JUNK`/`ds64` chunk.
pub const DS64_OFFSET: u64 = 12;

/// Body size of both the `JUNK` reservation and the `ds64` chunk.
pub const DS64_BODY_SIZE: u32 = 28;

const FMT_OFFSET: u64 = DS64_OFFSET + 8 + DS64_BODY_SIZE as u64;

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// KSDATAFORMAT_SUBTYPE_PCM, 00000001-0000-0010-8000-00aa00389b71.
const SUBTYPE_PCM: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Interleaved integer PCM description stored in the `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Plain PCM only covers mono/stereo 8/16-bit; everything else uses the extensible form.
    pub fn is_extensible(&self) -> bool {
        self.channels > 2 || self.bits_per_sample > 16
    }

    fn fmt_body_len(&self) -> u32 {
        if self.is_extensible() {
            40
        } else {
            16
        }
    }
}

impl From<&DeviceFormat> for PcmFormat {
    fn from(format: &DeviceFormat) -> Self {
        Self {
            sample_rate: format.effective_rate,
            channels: format.channels,
            bits_per_sample: format.bit_depth,
        }
    }
}

/// Byte offsets of the patchable fields for a given format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    fmt_body_len: u32,
}

impl HeaderLayout {
    pub fn for_format(format: &PcmFormat) -> Self {
        Self {
            fmt_body_len: format.fmt_body_len(),
        }
    }

    /// Offset of the 32-bit RIFF size.
    pub fn riff_size_offset(&self) -> u64 {
        4
    }

    /// Offset of the 32-bit `data` chunk size.
    pub fn data_size_offset(&self) -> u64 {
        FMT_OFFSET + 8 + self.fmt_body_len as u64 + 4
    }

    /// Total header length; the payload starts here.
    pub fn header_len(&self) -> u64 {
        self.data_size_offset() + 4
    }
}

/// Generate a header with placeholder (zero-payload) sizes.
pub fn generate_header(format: &PcmFormat) -> Vec<u8> {
    let layout = HeaderLayout::for_format(format);
    let mut header = Vec::with_capacity(layout.header_len() as usize);

    // RIFF chunk descriptor
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&((layout.header_len() - 8) as u32).to_le_bytes());
    header.extend_from_slice(b"WAVE");

    // Space for a future ds64
    header.extend_from_slice(b"JUNK");
    header.extend_from_slice(&DS64_BODY_SIZE.to_le_bytes());
    header.extend_from_slice(&[0u8; DS64_BODY_SIZE as usize]);

    // fmt sub-chunk
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&format.fmt_body_len().to_le_bytes());
    let tag = if format.is_extensible() {
        WAVE_FORMAT_EXTENSIBLE
    } else {
        WAVE_FORMAT_PCM
    };
    header.extend_from_slice(&tag.to_le_bytes());
    header.extend_from_slice(&format.channels.to_le_bytes());
    header.extend_from_slice(&format.sample_rate.to_le_bytes());
    header.extend_from_slice(&format.byte_rate().to_le_bytes());
    header.extend_from_slice(&format.block_align().to_le_bytes());
    header.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    if format.is_extensible() {
        header.extend_from_slice(&22u16.to_le_bytes()); // cbSize
        header.extend_from_slice(&format.bits_per_sample.to_le_bytes()); // valid bits
        header.extend_from_slice(&0u32.to_le_bytes()); // no speaker positions
        header.extend_from_slice(&SUBTYPE_PCM);
    }

    // data sub-chunk
    header.extend_from_slice(b"data");
    header.extend_from_slice(&0u32.to_le_bytes());

    debug_assert_eq!(header.len() as u64, layout.header_len());
    header
}

/// A complete `ds64` chunk (id, size, body) carrying 64-bit sizes.
pub fn ds64_chunk(riff_size: u64, data_size: u64, sample_count: u64) -> [u8; 8 + DS64_BODY_SIZE as usize] {
    let mut chunk = [0u8; 8 + DS64_BODY_SIZE as usize];
    chunk[0..4].copy_from_slice(b"ds64");
    chunk[4..8].copy_from_slice(&DS64_BODY_SIZE.to_le_bytes());
    chunk[8..16].copy_from_slice(&riff_size.to_le_bytes());
    chunk[16..24].copy_from_slice(&data_size.to_le_bytes());
    chunk[24..32].copy_from_slice(&sample_count.to_le_bytes());
    // [32..36] table length stays 0
    chunk
}

/// Parsed view of a RIFF or RF64 WAVE file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub format: PcmFormat,
    /// File starts with `RF64`.
    pub rf64: bool,
    /// Whether a `ds64` chunk was found. When present its sizes win.
    pub has_ds64: bool,
    pub data_offset: u64,
    /// Authoritative payload size.
    pub data_size: u64,
    pub legacy_riff_size: u32,
    pub legacy_data_size: u32,
}

impl ContainerInfo {
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, CaptureError> {
        reader.seek(SeekFrom::Start(0)).map_err(io_error)?;

        let mut riff = [0u8; 12];
        reader.read_exact(&mut riff).map_err(io_error)?;
        let rf64 = match &riff[0..4] {
            b"RIFF" => false,
            b"RF64" => true,
            other => return Err(format_error(format!("not a RIFF file: {:?}", other))),
        };
        if &riff[8..12] != b"WAVE" {
            return Err(format_error("missing WAVE form type"));
        }
        let legacy_riff_size = u32::from_le_bytes([riff[4], riff[5], riff[6], riff[7]]);

        let mut ds64_data_size: Option<u64> = None;
        let mut format: Option<PcmFormat> = None;

        loop {
            let mut chunk_header = [0u8; 8];
            match reader.read_exact(&mut chunk_header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(format_error("no data chunk"));
                }
                Err(e) => return Err(io_error(e)),
            }
            let id = [chunk_header[0], chunk_header[1], chunk_header[2], chunk_header[3]];
            let size = u32::from_le_bytes([chunk_header[4], chunk_header[5], chunk_header[6], chunk_header[7]]);

            match &id {
                b"ds64" => {
                    if size < 24 {
                        return Err(format_error(format!("ds64 chunk too small: {size}")));
                    }
                    let body = read_chunk_prefix(reader, size, DS64_BODY_SIZE as usize)?;
                    ds64_data_size = Some(read_u64(&body[8..16]));
                    skip_pad(reader, size)?;
                }
                b"fmt " => {
                    if size < 16 {
                        return Err(format_error(format!("fmt chunk too small: {size}")));
                    }
                    let body = read_chunk_prefix(reader, size, FMT_PARSED_LEN)?;
                    format = Some(parse_fmt(&body)?);
                    skip_pad(reader, size)?;
                }
                b"data" => {
                    let format = format.ok_or_else(|| format_error("data chunk before fmt chunk"))?;
                    let data_offset = reader.stream_position().map_err(io_error)?;
                    let data_size = match ds64_data_size {
                        Some(size64) => size64,
                        None if rf64 => {
                            return Err(format_error("RF64 file without ds64 chunk"));
                        }
                        None => size as u64,
                    };
                    return Ok(Self {
                        format,
                        rf64,
                        has_ds64: ds64_data_size.is_some(),
                        data_offset,
                        data_size,
                        legacy_riff_size,
                        legacy_data_size: size,
                    });
                }
                _ => {
                    reader.seek(SeekFrom::Current(size as i64)).map_err(io_error)?;
                    skip_pad(reader, size)?;
                }
            }
        }
    }

    /// Whole frames in the payload.
    pub fn frames(&self) -> u64 {
        match self.format.block_align() {
            0 => 0,
            align => self.data_size / align as u64,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.format.sample_rate as f64
    }
}

fn parse_fmt(body: &[u8]) -> Result<PcmFormat, CaptureError> {
    let tag = u16::from_le_bytes([body[0], body[1]]);
    let format = PcmFormat {
        channels: u16::from_le_bytes([body[2], body[3]]),
        sample_rate: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
        bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
    };
    match tag {
        WAVE_FORMAT_PCM => Ok(format),
        WAVE_FORMAT_EXTENSIBLE if body.len() >= 40 && body[24..40] == SUBTYPE_PCM => Ok(format),
        WAVE_FORMAT_EXTENSIBLE => Err(format_error("extensible format is not integer PCM")),
        other => Err(format_error(format!("unsupported format tag {other:#06x}"))),
    }
}

/// Longest `fmt ` prefix the parser looks at (WAVE_FORMAT_EXTENSIBLE through the subformat GUID).
const FMT_PARSED_LEN: usize = 40;

/// Read at most `keep` bytes of a chunk body and seek past the rest.
fn read_chunk_prefix<R: Read + Seek>(reader: &mut R, size: u32, keep: usize) -> Result<Vec<u8>, CaptureError> {
    let kept = (size as usize).min(keep);
    let mut body = vec![0u8; kept];
    reader.read_exact(&mut body).map_err(io_error)?;
    let rest = size as i64 - kept as i64;
    if rest > 0 {
        reader.seek(SeekFrom::Current(rest)).map_err(io_error)?;
    }
    Ok(body)
}

fn skip_pad<R: Seek>(reader: &mut R, size: u32) -> Result<(), CaptureError> {
    if size % 2 == 1 {
        reader.seek(SeekFrom::Current(1)).map_err(io_error)?;
    }
    Ok(())
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn io_error(e: std::io::Error) -> CaptureError {
    CaptureError::StorageError(format!("read failed: {e}"))
}

fn format_error(msg: impl Into<String>) -> CaptureError {
    CaptureError::ContainerFormat(msg.into())
}
