//! Content-identification protocol (C5): advertises or discovers the
//! content-id currently being presented, plus the endpoints of the
//! wall-clock (C3) and timeline (C4) services for that content. Persistent
//! framed TCP connection, JSON payload, 4-byte big-endian length prefix —
//! the same framing discipline as [`sync_timeline`].

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const MAX_FRAME_BYTES: u32 = 1 << 16;

#[derive(Debug, Error)]
pub enum ContentIdError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("content-id stream ended without cancellation")]
    StreamEnded,
}

/// Content-identification record (§6): `{contentId, wcUrl, tsUrl, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentIdRecord {
    pub protocol_version: String,
    pub content_id: String,
    pub presentation_status: String,
    pub wc_url: String,
    pub ts_url: String,
}

impl ContentIdRecord {
    /// Prefix-based stem match; an empty stem matches anything (§4.5).
    pub fn matches_stem(&self, stem: &str) -> bool {
        stem.is_empty() || self.content_id.starts_with(stem)
    }
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), ContentIdError> {
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ContentIdError> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(ContentIdError::Protocol(format!(
            "frame of {len} bytes exceeds limit {MAX_FRAME_BYTES}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Server role: the record is static for the whole measurement run and is
/// pushed once per accepted connection, then again whenever `record`
/// changes.
pub struct ContentIdServer {
    listener: TcpListener,
    record: watch::Receiver<ContentIdRecord>,
}

impl ContentIdServer {
    pub async fn bind(
        addr: SocketAddr,
        record: watch::Receiver<ContentIdRecord>,
    ) -> Result<Self, ContentIdError> {
        let listener = TcpListener::bind(addr).await?;
        info!(local = %listener.local_addr()?, "content-id server bound");
        Ok(Self { listener, record })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(&mut self, cancel: watch::Receiver<bool>) -> Result<(), ContentIdError> {
        self.serve_inner(cancel, None).await
    }

    /// Like [`ContentIdServer::serve`], but flips `peer_connected` to `true`
    /// the first time a client accepts — the composition root's rendezvous
    /// signal for CSA-measuring mode's WAIT_PEER exit condition (§4.10),
    /// since content-id is the first protocol contacted in the data flow.
    pub async fn serve_with_peer_signal(
        &mut self,
        cancel: watch::Receiver<bool>,
        peer_connected: watch::Sender<bool>,
    ) -> Result<(), ContentIdError> {
        self.serve_inner(cancel, Some(peer_connected)).await
    }

    async fn serve_inner(
        &mut self,
        mut cancel: watch::Receiver<bool>,
        peer_connected: Option<watch::Sender<bool>>,
    ) -> Result<(), ContentIdError> {
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("content-id server cancelled");
                        return Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Some(signal) = &peer_connected {
                        let _ = signal.send(true);
                    }
                    let record = self.record.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_client(stream, record, cancel).await {
                            warn!(%peer, %err, "content-id client session ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    mut record: watch::Receiver<ContentIdRecord>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), ContentIdError> {
    loop {
        let current = record.borrow().clone();
        write_frame(&mut stream, &serde_json::to_vec(&current)?).await?;
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Ok(());
                }
            }
            changed = record.changed() => {
                changed.map_err(|_| ContentIdError::Protocol("record channel closed".into()))?;
            }
        }
    }
}

/// Client role: the first valid record received unblocks the orchestrator.
pub struct ContentIdClient {
    stream: TcpStream,
}

impl ContentIdClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ContentIdError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Block until the first record arrives (or cancellation).
    pub async fn first_record(
        &mut self,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Option<ContentIdRecord>, ContentIdError> {
        tokio::select! {
            _ = cancel.changed() => Ok(None),
            frame = read_frame(&mut self.stream) => {
                let bytes = frame?;
                let record: ContentIdRecord = serde_json::from_slice(&bytes)?;
                debug!(content_id = %record.content_id, "content-id record received");
                Ok(Some(record))
            }
        }
    }

    /// Relay subsequent records into `latest` until cancellation or EOF.
    pub async fn run(
        mut self,
        latest: watch::Sender<ContentIdRecord>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ContentIdError> {
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                }
                frame = read_frame(&mut self.stream) => {
                    let bytes = frame?;
                    let record: ContentIdRecord = serde_json::from_slice(&bytes)?;
                    if latest.send(record).is_err() {
                        return Ok(());
                    }
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
    fn stem_matching_is_prefix_based() {
        let record = ContentIdRecord {
            protocol_version: "1.1".into(),
            content_id: "dvb://1234.abcd.5678".into(),
            presentation_status: "okay".into(),
            wc_url: "udp://host:6677".into(),
            ts_url: "tcp://host:6565".into(),
        };
        assert!(record.matches_stem(""));
        assert!(record.matches_stem("dvb://1234"));
        assert!(!record.matches_stem("dvb://9999"));
    }

    #[tokio::test]
    async fn client_receives_first_record() {
        let record = ContentIdRecord {
            protocol_version: "1.1".into(),
            content_id: "abc".into(),
            presentation_status: "okay".into(),
            wc_url: "udp://h:1".into(),
            ts_url: "tcp://h:2".into(),
        };
        let (_tx, rx) = watch::channel(record.clone());
        let mut server = ContentIdServer::bind("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move { server.serve(cancel_rx).await });

        let mut client = ContentIdClient::connect(addr).await.unwrap();
        let received = tokio::time::timeout(
            Duration::from_secs(2),
            client.first_record(cancel_tx.subscribe()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(received, record);

        cancel_tx.send(true).unwrap();
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn peer_signal_fires_on_first_accept() {
        let record = ContentIdRecord {
            protocol_version: "1.1".into(),
            content_id: "abc".into(),
            presentation_status: "okay".into(),
            wc_url: "udp://h:1".into(),
            ts_url: "tcp://h:2".into(),
        };
        let (_tx, rx) = watch::channel(record);
        let mut server = ContentIdServer::bind("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (peer_tx, mut peer_rx) = watch::channel(false);
        let server_task =
            tokio::spawn(async move { server.serve_with_peer_signal(cancel_rx, peer_tx).await });

        assert!(!*peer_rx.borrow());
        let _client = ContentIdClient::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), peer_rx.changed())
            .await
            .expect("timed out waiting for peer signal")
            .unwrap();
        assert!(*peer_rx.borrow());

        cancel_tx.send(true).unwrap();
        let _ = server_task.await;
    }
}
