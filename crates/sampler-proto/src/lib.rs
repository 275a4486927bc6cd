//! Wire framing for the sampling microcontroller's command language
//! (transport-agnostic — no serial I/O here, only encode/decode).
//!
//! Every response begins with a four-byte big-endian device-clock
//! microsecond counter; opcode-specific payload follows. Encoding a
//! command is always a single byte: the opcode itself.

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Size of the universal leading timestamp carried by every response.
pub const TIMESTAMP_SIZE: usize = 4;

/// Opcodes understood by the sampling microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Enable sampling on channel `0..=3`.
    Enable(u8),
    /// `'4'` — report active channel count and per-sample block budget.
    Prepare,
    /// `'S'` — perform the configured sampling run. Blocking on the device.
    Sample,
    /// `'B'` — upload the captured sample buffer.
    Bulk,
    /// `'T'` — ping; no payload beyond the universal timestamp.
    Ping,
}

impl Opcode {
    /// Raw byte sent on the wire for this opcode.
    pub const fn byte(self) -> u8 {
        match self {
            Opcode::Enable(ch) => b'0' + ch,
            Opcode::Prepare => b'4',
            Opcode::Sample => b'S',
            Opcode::Bulk => b'B',
            Opcode::Ping => b'T',
        }
    }

    /// Construct the enable opcode for a channel index, validating range `0..=3`.
    pub fn enable(channel: u8) -> Result<Self, ProtoError> {
        if channel > 3 {
            return Err(ProtoError::InvalidChannel(channel));
        }
        Ok(Opcode::Enable(channel))
    }
}

/// Errors produced while framing or parsing sampler packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("channel index {0} out of range 0..=3")]
    InvalidChannel(u8),
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },
    #[error("bulk payload length mismatch: header claims {claimed}, expected {expected}")]
    BulkLengthMismatch { claimed: usize, expected: usize },
    #[error("prepare reported zero active channels; channel configuration was lost")]
    PrepareZeroed,
}

/// Encode a command as the single byte written to the serial port.
pub fn encode(opcode: Opcode) -> u8 {
    opcode.byte()
}

/// Parse the universal four-byte big-endian device-clock microsecond counter
/// that leads every response, returning it and the remaining bytes.
pub fn take_timestamp(buf: &[u8]) -> Result<(u32, &[u8]), ProtoError> {
    if buf.len() < TIMESTAMP_SIZE {
        return Err(ProtoError::ShortRead {
            need: TIMESTAMP_SIZE,
            have: buf.len(),
        });
    }
    let mut cursor = buf;
    let ts = cursor.get_u32();
    Ok((ts, cursor))
}

/// Response to `'4'` (prepare): active channel count and blocks-per-sample budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareAck {
    pub device_ts: u32,
    pub n_active_channels: u32,
    pub n_ms_blocks: u32,
}

/// Total bytes of sampling RAM on the microcontroller (§6).
pub const SAMPLE_BUFFER_CAPACITY: usize = 92_160;

/// `nMillisecondBlocks = floor(92160 / (2 * nActiveChannels))`.
pub fn ms_blocks_for_channels(n_active_channels: u32) -> u32 {
    if n_active_channels == 0 {
        return 0;
    }
    (SAMPLE_BUFFER_CAPACITY as u32) / (2 * n_active_channels)
}

/// Decode a `'4'` prepare acknowledgement.
pub fn decode_prepare(buf: &[u8]) -> Result<PrepareAck, ProtoError> {
    let (device_ts, rest) = take_timestamp(buf)?;
    if rest.len() < 8 {
        return Err(ProtoError::ShortRead {
            need: 8,
            have: rest.len(),
        });
    }
    let mut cursor = rest;
    let n_active_channels = cursor.get_u32();
    let n_ms_blocks = cursor.get_u32();
    if n_active_channels == 0 || n_ms_blocks == 0 {
        return Err(ProtoError::PrepareZeroed);
    }
    Ok(PrepareAck {
        device_ts,
        n_active_channels,
        n_ms_blocks,
    })
}

/// Response to `'S'` (sample): device-clock instants bracketing the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleAck {
    pub device_ts: u32,
    pub start_device_time: u32,
    pub end_device_time: u32,
    pub n_ms_blocks: u32,
}

/// Decode an `'S'` sample acknowledgement.
pub fn decode_sample(buf: &[u8]) -> Result<SampleAck, ProtoError> {
    let (device_ts, rest) = take_timestamp(buf)?;
    if rest.len() < 12 {
        return Err(ProtoError::ShortRead {
            need: 12,
            have: rest.len(),
        });
    }
    let mut cursor = rest;
    let start_device_time = cursor.get_u32();
    let end_device_time = cursor.get_u32();
    let n_ms_blocks = cursor.get_u32();
    Ok(SampleAck {
        device_ts,
        start_device_time,
        end_device_time,
        n_ms_blocks,
    })
}

/// One millisecond of `(max, min)` samples for one active channel, as they
/// appear back-to-back in the `'B'` bulk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSample {
    pub max: u8,
    pub min: u8,
}

/// Parsed `'B'` bulk acknowledgement header plus the still-packed byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkHeader {
    pub device_ts: u32,
    pub byte_count: u32,
}

/// Decode the four-byte timestamp and four-byte length header of a bulk
/// acknowledgement. The caller reads `byte_count` further bytes from the
/// transport and passes them to [`decode_bulk_body`].
pub fn decode_bulk_header(buf: &[u8]) -> Result<BulkHeader, ProtoError> {
    let (device_ts, rest) = take_timestamp(buf)?;
    if rest.len() < 4 {
        return Err(ProtoError::ShortRead {
            need: 4,
            have: rest.len(),
        });
    }
    let mut cursor = rest;
    let byte_count = cursor.get_u32();
    Ok(BulkHeader {
        device_ts,
        byte_count,
    })
}

/// Unpack the bulk payload into per-block, per-channel `(max, min)` pairs.
/// Layout: `nMillisecondBlocks * nActiveChannels * 2` bytes, channels in
/// ascending enabled-index order within each block.
pub fn decode_bulk_body(
    body: &[u8],
    n_active_channels: u32,
    n_ms_blocks: u32,
) -> Result<Vec<Vec<RawSample>>, ProtoError> {
    let expected = (n_active_channels as usize) * (n_ms_blocks as usize) * 2;
    if body.len() != expected {
        return Err(ProtoError::BulkLengthMismatch {
            claimed: body.len(),
            expected,
        });
    }
    let mut blocks = Vec::with_capacity(n_ms_blocks as usize);
    let mut cursor = body;
    for _ in 0..n_ms_blocks {
        let mut channels = Vec::with_capacity(n_active_channels as usize);
        for _ in 0..n_active_channels {
            let max = cursor.get_u8();
            let min = cursor.get_u8();
            channels.push(RawSample { max, min });
        }
        blocks.push(channels);
    }
    Ok(blocks)
}

/// Response to `'T'` (ping): the universal timestamp alone.
pub fn decode_ping(buf: &[u8]) -> Result<u32, ProtoError> {
    let (device_ts, _rest) = take_timestamp(buf)?;
    Ok(device_ts)
}

/// Bytes of a `Bytes`-backed response, handy when assembling test fixtures.
pub fn response_bytes(parts: &[&[u8]]) -> Bytes {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part);
    }
    Bytes::from(out)
}
