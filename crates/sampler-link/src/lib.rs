//! Serial transport for the sampling microcontroller (C1).
//!
//! The microcontroller's command language is blocking by construction: the
//! `'S'` sample command does not return until the requested sampling window
//! has actually elapsed (up to ~45 s). [`SamplerLink`] is therefore a
//! synchronous, blocking API; [`AsyncSamplerLink`] bridges it into an async
//! orchestrator via [`tokio::task::spawn_blocking`], mirroring (in the
//! opposite direction) the `Handle::block_on` bridge a GigE register
//! transport uses to expose an async device over a synchronous facade.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sampler_proto::{
    decode_bulk_body, decode_bulk_header, decode_ping, decode_prepare, decode_sample, encode,
    ms_blocks_for_channels, Opcode, PrepareAck, ProtoError, RawSample, SampleAck,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Baud rate mandated by the sampler's USB virtual serial port (§6).
pub const BAUD_RATE: u32 = 2_304_200;

/// Default timeout applied to individual serial reads while framing a
/// response. The `'S'` sample call overrides this with a window sized to
/// the requested capture duration.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors fatal to the measurement: serial framing or read failures,
/// malformed responses, or a prepare report indicating lost channel state.
#[derive(Debug, Error)]
pub enum SamplerLinkError {
    #[error("serial io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port: {0}")]
    Port(#[from] serialport::Error),
    #[error("framing: {0}")]
    Proto(#[from] ProtoError),
    #[error("timed out waiting for sampler response")]
    Timeout,
    #[error("bulk acknowledgement byte count mismatch: header said {claimed}, expected {expected}")]
    BulkCountMismatch { claimed: usize, expected: usize },
}

/// Blocking driver for one serial conversation with the sampler.
pub struct SamplerLink {
    port: Box<dyn serialport::SerialPort>,
    active_channels: Vec<u8>,
    n_ms_blocks: u32,
}

impl SamplerLink {
    /// Open the sampler's virtual COM port at the mandated baud rate, 8N1.
    pub fn open(path: &str) -> Result<Self, SamplerLinkError> {
        info!(path, baud = BAUD_RATE, "opening sampler serial link");
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open()?;
        Ok(Self {
            port,
            active_channels: Vec::new(),
            n_ms_blocks: 0,
        })
    }

    fn send(&mut self, opcode: Opcode) -> Result<(), SamplerLinkError> {
        trace!(byte = encode(opcode), "writing opcode");
        self.port.write_all(&[encode(opcode)])?;
        Ok(())
    }

    fn read_exact_within(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, SamplerLinkError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            if Instant::now() >= deadline {
                return Err(SamplerLinkError::Timeout);
            }
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => continue,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        return Err(SamplerLinkError::Timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    /// Enable sampling on a channel index `0..=3`. Idempotent; must precede
    /// [`SamplerLink::prepare`].
    pub fn enable_channel(&mut self, channel: u8) -> Result<(), SamplerLinkError> {
        let opcode = Opcode::enable(channel)?;
        self.send(opcode)?;
        let _resp = self.read_exact_within(sampler_proto::TIMESTAMP_SIZE, DEFAULT_READ_TIMEOUT)?;
        if !self.active_channels.contains(&channel) {
            self.active_channels.push(channel);
        }
        debug!(channel, "channel enabled");
        Ok(())
    }

    /// `'4'` prepare: report the active channel count and per-run block budget.
    pub fn prepare(&mut self) -> Result<PrepareAck, SamplerLinkError> {
        self.send(Opcode::Prepare)?;
        let resp = self.read_exact_within(sampler_proto::TIMESTAMP_SIZE + 8, DEFAULT_READ_TIMEOUT)?;
        let ack = decode_prepare(&resp)?;
        debug_assert_eq!(
            ack.n_ms_blocks,
            ms_blocks_for_channels(ack.n_active_channels)
        );
        self.n_ms_blocks = ack.n_ms_blocks;
        info!(
            n_active = ack.n_active_channels,
            n_blocks = ack.n_ms_blocks,
            "sampler prepared"
        );
        Ok(ack)
    }

    /// `'S'` sample: blocks for the duration of the capture window.
    pub fn sample(&mut self) -> Result<SampleAck, SamplerLinkError> {
        // One millisecond per block, plus slack for framing/scheduling jitter.
        let window = Duration::from_millis(self.n_ms_blocks as u64) + Duration::from_secs(5);
        self.send(Opcode::Sample)?;
        let resp = self.read_exact_within(sampler_proto::TIMESTAMP_SIZE + 12, window)?;
        let ack = decode_sample(&resp)?;
        info!(
            start = ack.start_device_time,
            end = ack.end_device_time,
            blocks = ack.n_ms_blocks,
            "sample run complete"
        );
        Ok(ack)
    }

    /// `'B'` bulk: upload and unpack the captured buffer.
    pub fn bulk(&mut self) -> Result<Vec<Vec<RawSample>>, SamplerLinkError> {
        self.send(Opcode::Bulk)?;
        let header_bytes =
            self.read_exact_within(sampler_proto::TIMESTAMP_SIZE + 4, DEFAULT_READ_TIMEOUT)?;
        let header = decode_bulk_header(&header_bytes)?;
        let n_active = self.active_channels.len() as u32;
        let expected = (n_active as usize) * (self.n_ms_blocks as usize) * 2;
        if header.byte_count as usize != expected {
            warn!(
                claimed = header.byte_count,
                expected, "bulk byte count mismatch"
            );
            return Err(SamplerLinkError::BulkCountMismatch {
                claimed: header.byte_count as usize,
                expected,
            });
        }
        let body = self.read_exact_within(header.byte_count as usize, DEFAULT_READ_TIMEOUT * 4)?;
        let blocks = decode_bulk_body(&body, n_active, self.n_ms_blocks)?;
        info!(bytes = header.byte_count, "bulk upload complete");
        Ok(blocks)
    }

    /// `'T'` ping: returns only the universal leading timestamp.
    pub fn ping(&mut self) -> Result<u32, SamplerLinkError> {
        self.send(Opcode::Ping)?;
        let resp = self.read_exact_within(sampler_proto::TIMESTAMP_SIZE, DEFAULT_READ_TIMEOUT)?;
        Ok(decode_ping(&resp)?)
    }

    /// Currently enabled channel indices in ascending order.
    pub fn active_channels(&self) -> &[u8] {
        &self.active_channels
    }
}

/// Async adapter exposing [`SamplerLink`] to a `tokio` orchestrator. Each
/// call runs the blocking operation on the blocking thread pool; the
/// underlying port is owned exclusively by this handle (§5 resource policy).
#[derive(Clone)]
pub struct AsyncSamplerLink {
    inner: Arc<Mutex<SamplerLink>>,
}

impl AsyncSamplerLink {
    pub fn new(link: SamplerLink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(link)),
        }
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T, SamplerLinkError>
    where
        F: FnOnce(&mut SamplerLink) -> Result<T, SamplerLinkError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().expect("sampler link mutex poisoned");
            f(&mut guard)
        })
        .await
        .expect("sampler link blocking task panicked")
    }

    pub async fn enable_channel(&self, channel: u8) -> Result<(), SamplerLinkError> {
        self.run_blocking(move |link| link.enable_channel(channel))
            .await
    }

    pub async fn prepare(&self) -> Result<PrepareAck, SamplerLinkError> {
        self.run_blocking(|link| link.prepare()).await
    }

    pub async fn sample(&self) -> Result<SampleAck, SamplerLinkError> {
        self.run_blocking(|link| link.sample()).await
    }

    pub async fn bulk(&self) -> Result<Vec<Vec<RawSample>>, SamplerLinkError> {
        self.run_blocking(|link| link.bulk()).await
    }

    pub async fn ping(&self) -> Result<u32, SamplerLinkError> {
        self.run_blocking(|link| link.ping()).await
    }

    /// Currently enabled channel indices in ascending order, snapshotted
    /// synchronously off the blocking thread pool.
    pub fn active_channels_snapshot(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("sampler link mutex poisoned")
            .active_channels()
            .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_matches_spec_table() {
        for (channels, expected) in [(1, 46080), (2, 23040), (3, 15360), (4, 11520)] {
            assert_eq!(ms_blocks_for_channels(channels), expected);
        }
    }
}
