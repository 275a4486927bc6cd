//! Timeline synchronisation protocol (C4): a persistent framed TCP
//! connection carrying JSON control-timestamp messages. Frames are
//! length-prefixed (4-byte big-endian byte count + JSON body), matching the
//! length-then-payload discipline used elsewhere in this workspace's wire
//! protocols.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Maximum accepted frame size; guards against a runaway peer.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("timeline stream ended without cancellation")]
    StreamEnded,
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), TimelineError> {
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TimelineError> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(TimelineError::Protocol(format!(
            "frame of {len} bytes exceeds limit {MAX_FRAME_BYTES}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Wire shape of a tick-rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRateWire {
    pub num: u64,
    pub den: u64,
}

/// A client's initial (and only) request: the content-id stem to filter on,
/// the desired timeline selector, and the tick-rate it wants ticks expressed
/// in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRequest {
    pub content_id_stem: String,
    pub timeline_selector: String,
    pub tick_rate: TickRateWire,
}

/// Wire shape of a control timestamp (§3, §6). `content_time` (and its
/// companions) are `None` to encode the "null CT" — timeline unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTimestampWire {
    pub content_id: String,
    pub content_id_status: String,
    pub presentation_status: String,
    pub timeline_selector: String,
    pub tick_rate: TickRateWire,
    pub content_time: Option<i64>,
    pub wall_clock_time: Option<i64>,
    pub timeline_speed_multiplier: Option<f64>,
}

impl ControlTimestampWire {
    pub fn is_null(&self) -> bool {
        self.content_time.is_none()
    }
}

/// Shared authoritative timeline state on the server side. `None` means "no
/// timeline currently available" (the null correlation of §3).
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineState {
    pub content_id: String,
    pub content_id_status: String,
    pub presentation_status: String,
    pub correlation: Option<CorrelationPoint>,
}

/// `(refClockInstant, timelineTick, speed)` — the linear map from reference
/// clock time to timeline ticks. `speed == 0` encodes a paused timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPoint {
    pub ref_clock_instant_ns: i64,
    pub timeline_tick: i64,
    pub speed: f64,
}

fn project(state: &TimelineState, tick_rate: TickRateWire, now_ns: i64) -> ControlTimestampWire {
    match state.correlation {
        None => ControlTimestampWire {
            content_id: state.content_id.clone(),
            content_id_status: state.content_id_status.clone(),
            presentation_status: state.presentation_status.clone(),
            timeline_selector: String::new(),
            tick_rate,
            content_time: None,
            wall_clock_time: None,
            timeline_speed_multiplier: None,
        },
        Some(corr) => {
            let tick_hz = tick_rate.den as f64 / tick_rate.num as f64;
            let dt_s = (now_ns - corr.ref_clock_instant_ns) as f64 / 1e9;
            let tick = corr.timeline_tick as f64 + dt_s * tick_hz * corr.speed;
            ControlTimestampWire {
                content_id: state.content_id.clone(),
                content_id_status: state.content_id_status.clone(),
                presentation_status: state.presentation_status.clone(),
                timeline_selector: String::new(),
                tick_rate,
                content_time: Some(tick.round() as i64),
                wall_clock_time: Some(now_ns),
                timeline_speed_multiplier: Some(corr.speed),
            }
        }
    }
}

/// Server role: emits a CT whenever the authoritative correlation,
/// content-id, or tick-rate changes, and once on client connect.
pub struct TimelineServer {
    listener: TcpListener,
    state: watch::Receiver<TimelineState>,
}

impl TimelineServer {
    pub async fn bind(
        addr: SocketAddr,
        state: watch::Receiver<TimelineState>,
    ) -> Result<Self, TimelineError> {
        let listener = TcpListener::bind(addr).await?;
        info!(local = %listener.local_addr()?, "timeline server bound");
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires, spawning one task per client.
    pub async fn serve(&mut self, mut cancel: watch::Receiver<bool>) -> Result<(), TimelineError> {
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("timeline server cancelled");
                        return Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let state = self.state.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_client(stream, state, cancel).await {
                            warn!(%peer, %err, "timeline client session ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    mut state: watch::Receiver<TimelineState>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TimelineError> {
    let req_bytes = read_frame(&mut stream).await?;
    let request: TimelineRequest = serde_json::from_slice(&req_bytes)?;
    debug!(?request, "timeline client request");

    loop {
        let now_ns = now_ns();
        let ct = project(&state.borrow(), request.tick_rate, now_ns);
        write_frame(&mut stream, &serde_json::to_vec(&ct)?).await?;

        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Ok(());
                }
            }
            changed = state.changed() => {
                changed.map_err(|_| TimelineError::Protocol("state channel closed".into()))?;
            }
        }
    }
}

/// UNIX-epoch nanoseconds: the shared wall-clock domain every CT's
/// `wallClockTime` field is expressed in (§4.9 assumes translator's
/// host-clock arithmetic and a CT's timestamp agree on one epoch).
fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Client role: connects once, sends its selector, then relays the CT
/// stream. A stream that ends without cancellation is fatal (§4.4).
pub struct TimelineClient {
    stream: TcpStream,
}

impl TimelineClient {
    pub async fn connect(
        addr: SocketAddr,
        request: TimelineRequest,
    ) -> Result<Self, TimelineError> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &serde_json::to_vec(&request)?).await?;
        Ok(Self { stream })
    }

    /// Relay incoming CTs to `latest` until `cancel` fires or the stream ends.
    pub async fn run(
        mut self,
        latest: watch::Sender<ControlTimestampWire>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), TimelineError> {
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                }
                frame = read_frame(&mut self.stream) => {
                    let bytes = frame?;
                    let ct: ControlTimestampWire = serde_json::from_slice(&bytes)?;
                    debug!(null = ct.is_null(), "control timestamp received");
                    if latest.send(ct).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Relay incoming CTs via an mpsc channel instead of a `watch`, for callers
/// that need every intermediate CT rather than only the latest.
pub async fn relay_all(
    mut stream: TcpStream,
    out: mpsc::Sender<ControlTimestampWire>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TimelineError> {
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Ok(());
                }
            }
            frame = read_frame(&mut stream) => {
                let bytes = frame?;
                let ct: ControlTimestampWire = serde_json::from_slice(&bytes)?;
                if out.send(ct).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn null_ct_detected() {
        let ct = ControlTimestampWire {
            content_id: "abc".into(),
            content_id_status: "ok".into(),
            presentation_status: "ok".into(),
            timeline_selector: "sel".into(),
            tick_rate: TickRateWire { num: 1, den: 90000 },
            content_time: None,
            wall_clock_time: None,
            timeline_speed_multiplier: None,
        };
        assert!(ct.is_null());
    }

    #[test]
    fn projection_advances_with_speed() {
        let state = TimelineState {
            content_id: "abc".into(),
            content_id_status: "partial".into(),
            presentation_status: "okay".into(),
            correlation: Some(CorrelationPoint {
                ref_clock_instant_ns: 0,
                timeline_tick: 0,
                speed: 1.0,
            }),
        };
        let rate = TickRateWire { num: 1, den: 90000 };
        let one_second_later = 1_000_000_000;
        let ct = project(&state, rate, one_second_later);
        assert_eq!(ct.content_time, Some(90000));
    }

    #[test]
    fn projection_is_null_when_no_correlation() {
        let state = TimelineState {
            content_id: "abc".into(),
            content_id_status: "none".into(),
            presentation_status: "none".into(),
            correlation: None,
        };
        let ct = project(&state, TickRateWire { num: 1, den: 90000 }, 0);
        assert!(ct.is_null());
    }

    #[tokio::test]
    async fn server_emits_ct_on_connect() {
        let (state_tx, state_rx) = watch::channel(TimelineState {
            content_id: "abc".into(),
            content_id_status: "ok".into(),
            presentation_status: "ok".into(),
            correlation: Some(CorrelationPoint {
                ref_clock_instant_ns: 0,
                timeline_tick: 1000,
                speed: 1.0,
            }),
        });
        let mut server = TimelineServer::bind("127.0.0.1:0".parse().unwrap(), state_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move { server.serve(cancel_rx).await });

        let req = TimelineRequest {
            content_id_stem: String::new(),
            timeline_selector: "sel".into(),
            tick_rate: TickRateWire { num: 1, den: 90000 },
        };
        let client = TimelineClient::connect(addr, req).await.unwrap();
        let (latest_tx, mut latest_rx) = watch::channel(ControlTimestampWire {
            content_id: String::new(),
            content_id_status: String::new(),
            presentation_status: String::new(),
            timeline_selector: String::new(),
            tick_rate: TickRateWire { num: 1, den: 90000 },
            content_time: None,
            wall_clock_time: None,
            timeline_speed_multiplier: None,
        });
        let client_cancel = cancel_tx.subscribe();
        let client_task = tokio::spawn(async move { client.run(latest_tx, client_cancel).await });

        tokio::time::timeout(Duration::from_secs(2), latest_rx.changed())
            .await
            .expect("timed out waiting for CT")
            .unwrap();
        assert!(!latest_rx.borrow().is_null());

        drop(state_tx);
        cancel_tx.send(true).unwrap();
        let _ = server_task.await;
        let _ = client_task.await;
    }
}
