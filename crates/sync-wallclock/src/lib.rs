//! Wall-clock synchronisation protocol (C3): a two-role NTP-style exchange
//! distributing a common notion of "wall-clock time" between a host and a
//! peer. Request/response packets are fixed-size with nanosecond-precision
//! signed 8-byte timestamps (§6).
//!
//! Server role answers requests with the host's own clock as the reference
//! and reports no dispersion outward. Client role periodically polls a
//! server, maintains a filtered `(remote - local)` offset, and emits
//! dispersion update events as the estimate's uncertainty evolves.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// Size in bytes of the wire packet (§6): version, type, precision,
/// max-freq-error, originate, receive, transmit.
pub const PACKET_SIZE: usize = 1 + 1 + 1 + 4 + 8 + 8 + 8;

/// Packet type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request,
    Response,
}

impl PacketType {
    fn to_raw(self) -> u8 {
        match self {
            PacketType::Request => 0,
            PacketType::Response => 1,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, WallClockError> {
        match raw {
            0 => Ok(PacketType::Request),
            1 => Ok(PacketType::Response),
            other => Err(WallClockError::Protocol(format!(
                "unknown wall-clock packet type {other}"
            ))),
        }
    }
}

/// Wall-clock protocol packet. Timestamps are signed nanoseconds since an
/// implementation-defined epoch; only differences between them are
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClockPacket {
    pub version: u8,
    pub msg_type: PacketType,
    pub precision: i8,
    pub max_freq_error: i32,
    pub originate: i64,
    pub receive: i64,
    pub transmit: i64,
}

impl WallClockPacket {
    pub fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_SIZE);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type.to_raw());
        buf.put_i8(self.precision);
        buf.put_i32(self.max_freq_error);
        buf.put_i64(self.originate);
        buf.put_i64(self.receive);
        buf.put_i64(self.transmit);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WallClockError> {
        if buf.len() != PACKET_SIZE {
            return Err(WallClockError::Protocol(format!(
                "wall-clock packet wrong size: {} (want {PACKET_SIZE})",
                buf.len()
            )));
        }
        let mut cursor = buf;
        let version = cursor.get_u8();
        let msg_type = PacketType::from_raw(cursor.get_u8())?;
        let precision = cursor.get_i8();
        let max_freq_error = cursor.get_i32();
        let originate = cursor.get_i64();
        let receive = cursor.get_i64();
        let transmit = cursor.get_i64();
        Ok(Self {
            version,
            msg_type,
            precision,
            max_freq_error,
            originate,
            receive,
            transmit,
        })
    }
}

/// Errors from either protocol role.
#[derive(Debug, Error)]
pub enum WallClockError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("timed out waiting for wall-clock response")]
    Timeout,
}

fn now_ns() -> i64 {
    // UNIX-epoch nanoseconds: the NTP-style offset algebra in `poll_once`
    // compares timestamps taken by two independent processes, so both sides
    // must agree on a common epoch, not merely a monotonic clock each reads
    // consistently with itself.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Server role (C3): answers wall-clock requests using the host's own clock
/// as the reference. No dispersion is reported outward.
pub struct WallClockServer {
    socket: UdpSocket,
}

impl WallClockServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, WallClockError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(local = %socket.local_addr()?, "wall-clock server bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until `cancel` fires. Cancellation closes the socket;
    /// any in-flight response is simply not sent.
    pub async fn serve(&self, mut cancel: watch::Receiver<bool>) -> Result<(), WallClockError> {
        let mut buf = [0u8; PACKET_SIZE + 16];
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("wall-clock server cancelled");
                        return Ok(());
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (len, src) = recv?;
                    let receive_rx = now_ns();
                    if len != PACKET_SIZE {
                        warn!(len, %src, "dropping malformed wall-clock request");
                        continue;
                    }
                    let request = match WallClockPacket::decode(&buf[..len]) {
                        Ok(p) => p,
                        Err(err) => {
                            warn!(%err, %src, "dropping unparseable wall-clock request");
                            continue;
                        }
                    };
                    if request.msg_type != PacketType::Request {
                        continue;
                    }
                    let response_tx = now_ns();
                    let response = WallClockPacket {
                        version: request.version,
                        msg_type: PacketType::Response,
                        precision: request.precision,
                        max_freq_error: request.max_freq_error,
                        originate: request.transmit,
                        receive: receive_rx,
                        transmit: response_tx,
                    };
                    trace!(%src, "answering wall-clock request");
                    self.socket.send_to(&response.encode(), src).await?;
                }
            }
        }
    }
}

/// A single filtered offset/dispersion estimate, emitted to C6 on update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispersionUpdate {
    /// Host-local instant the update was received (§5 ordering guarantee (b)).
    pub at: Instant,
    /// Upper bound on wall-clock uncertainty, seconds, always non-negative.
    pub dispersion_secs: f64,
    /// Filtered `(remote - local)` offset, seconds, held between polls the
    /// same way dispersion is held (§3 invariant (b)).
    pub offset_secs: f64,
}

/// Client role (C3): periodically polls a server and maintains a filtered
/// `(remote - local)` offset estimate. Dispersion updates are pushed to the
/// provided channel as they change (held constant between polls per §3
/// invariant (b), enforced by the consumer — C6 — not here).
pub struct WallClockClient {
    socket: UdpSocket,
    server: SocketAddr,
    poll_interval: Duration,
    request_timeout: Duration,
    /// Exponential smoothing factor for the offset filter, `0 < alpha <= 1`.
    alpha: f64,
}

impl WallClockClient {
    pub async fn connect(server: SocketAddr) -> Result<Self, WallClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            server,
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            alpha: 0.25,
        })
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn poll_once(&self) -> Result<(f64, f64), WallClockError> {
        let originate = now_ns();
        let request = WallClockPacket {
            version: 1,
            msg_type: PacketType::Request,
            precision: -20,
            max_freq_error: 0,
            originate,
            receive: 0,
            transmit: originate,
        };
        self.socket.send(&request.encode()).await?;

        let mut buf = [0u8; PACKET_SIZE + 16];
        let len = time::timeout(self.request_timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| WallClockError::Timeout)??;
        let receive_rx = now_ns();
        if len != PACKET_SIZE {
            return Err(WallClockError::Protocol("short wall-clock response".into()));
        }
        let response = WallClockPacket::decode(&buf[..len])?;
        if response.msg_type != PacketType::Response || response.originate != originate {
            return Err(WallClockError::Protocol(
                "wall-clock response did not match outstanding request".into(),
            ));
        }

        let t1 = response.originate as f64;
        let t2 = response.receive as f64;
        let t3 = response.transmit as f64;
        let t4 = receive_rx as f64;
        let offset_ns = ((t2 - t1) + (t3 - t4)) / 2.0;
        let round_trip_ns = (t4 - t1) - (t3 - t2);
        let dispersion_secs = (round_trip_ns.max(0.0) / 2.0) / 1e9;
        Ok((offset_ns / 1e9, dispersion_secs))
    }

    /// Run the client polling loop until `cancel` fires, emitting filtered
    /// offset and dispersion updates over `updates`.
    pub async fn run(
        self,
        updates: mpsc::Sender<DispersionUpdate>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), WallClockError> {
        let mut filtered_offset: Option<f64> = None;
        let mut ticker = time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!(server = %self.server, "wall-clock client cancelled");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok((offset, dispersion)) => {
                            filtered_offset = Some(match filtered_offset {
                                Some(prev) => prev + self.alpha * (offset - prev),
                                None => offset,
                            });
                            debug!(
                                offset_s = filtered_offset,
                                dispersion_s = dispersion,
                                "wall-clock sample"
                            );
                            let update = DispersionUpdate {
                                at: Instant::now(),
                                dispersion_secs: dispersion,
                                offset_secs: filtered_offset.unwrap_or(offset),
                            };
                            if updates.send(update).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            warn!(%err, server = %self.server, "wall-clock poll failed, retrying");
                        }
                    }
                }
            }
        }
    }
}
