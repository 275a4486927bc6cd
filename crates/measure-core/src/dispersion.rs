//! Dispersion recorder (C6, §4.6): relays wall-clock dispersion updates
//! into an append-only [`DispersionRecord`], or synthesizes constant zero
//! dispersion in server role. Also maintains the companion filtered-offset
//! log that C9 consults for the host -> synchronised wall-clock leg.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::debug;

use crate::model::{DispersionRecord, WallClockOffsetLog};
use sync_wallclock::DispersionUpdate;

/// Server role never reports dispersion outward (§4.3): the recorder holds
/// a single zero-dispersion, zero-offset point for the whole run.
pub fn server_role_record(start_wall_clock: f64) -> (DispersionRecord, WallClockOffsetLog) {
    let mut dispersion = DispersionRecord::new();
    dispersion.push(start_wall_clock, 0.0);
    let mut offset = WallClockOffsetLog::new();
    offset.push(start_wall_clock, 0.0);
    (dispersion, offset)
}

/// Drain `updates` into shared, lock-protected logs for the lifetime of a
/// background task spanning SYNCING through the UPLOADING->ANALYSING freeze
/// point (§4.10), signalling `converged` the first time the recorded
/// dispersion falls at or below `ceiling_secs` (the WAIT_PEER -> SYNCING
/// exit condition in TV-measuring mode). The logs are `Arc`-shared so the
/// orchestrator can keep recording through SAMPLING/UPLOADING while it waits
/// on convergence separately, then freeze and read back the final state.
pub async fn run_client_role_shared(
    mut updates: mpsc::Receiver<DispersionUpdate>,
    dispersion: Arc<AsyncMutex<DispersionRecord>>,
    offset: Arc<AsyncMutex<WallClockOffsetLog>>,
    start: std::time::Instant,
    ceiling_secs: f64,
    converged: watch::Sender<bool>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            update = updates.recv() => {
                match update {
                    Some(update) => {
                        let w = update.at.duration_since(start).as_secs_f64();
                        debug!(
                            wall_clock = w,
                            dispersion_s = update.dispersion_secs,
                            offset_s = update.offset_secs,
                            "dispersion update recorded"
                        );
                        dispersion.lock().await.push(w, update.dispersion_secs);
                        offset.lock().await.push(w, update.offset_secs);
                        if update.dispersion_secs <= ceiling_secs {
                            let _ = converged.send(true);
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn client_role_relays_updates_in_receipt_order() {
        let (tx, rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (converged_tx, _converged_rx) = watch::channel(false);
        let start = Instant::now();
        let dispersion = Arc::new(AsyncMutex::new(DispersionRecord::new()));
        let offset = Arc::new(AsyncMutex::new(WallClockOffsetLog::new()));

        let d = dispersion.clone();
        let o = offset.clone();
        let handle = tokio::spawn(async move {
            run_client_role_shared(rx, d, o, start, 0.0, converged_tx, cancel_rx).await;
        });

        tx.send(DispersionUpdate {
            at: start + Duration::from_millis(1),
            dispersion_secs: 0.002,
            offset_secs: 0.1,
        })
        .await
        .unwrap();
        tx.send(DispersionUpdate {
            at: start + Duration::from_millis(2),
            dispersion_secs: 0.004,
            offset_secs: 0.12,
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(dispersion.lock().await.len(), 2);
        assert_eq!(offset.lock().await.at(10.0), Some(0.12));
        let _ = cancel_tx;
    }

    #[test]
    fn server_role_is_constant_zero() {
        let (dispersion, offset) = server_role_record(0.0);
        assert_eq!(dispersion.at(1_000.0), Some(0.0));
        assert_eq!(offset.at(1_000.0), Some(0.0));
    }

    #[tokio::test]
    async fn shared_role_signals_convergence_and_keeps_recording() {
        let (tx, rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (converged_tx, mut converged_rx) = watch::channel(false);
        let start = Instant::now();
        let dispersion = Arc::new(AsyncMutex::new(DispersionRecord::new()));
        let offset = Arc::new(AsyncMutex::new(WallClockOffsetLog::new()));

        let d = dispersion.clone();
        let o = offset.clone();
        let handle = tokio::spawn(async move {
            run_client_role_shared(rx, d, o, start, 0.003, converged_tx, cancel_rx).await;
        });

        tx.send(DispersionUpdate {
            at: start,
            dispersion_secs: 0.02,
            offset_secs: 0.0,
        })
        .await
        .unwrap();
        assert!(!*converged_rx.borrow());

        tx.send(DispersionUpdate {
            at: start,
            dispersion_secs: 0.001,
            offset_secs: 0.0,
        })
        .await
        .unwrap();
        converged_rx.changed().await.unwrap();
        assert!(*converged_rx.borrow());

        // Recording continues after convergence, e.g. growing dispersion
        // during SAMPLING (scenario 2).
        tx.send(DispersionUpdate {
            at: start,
            dispersion_secs: 0.006,
            offset_secs: 0.0,
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(dispersion.lock().await.len(), 3);
        cancel_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn client_role_tolerates_synthetic_jitter() {
        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (converged_tx, _converged_rx) = watch::channel(false);
        let start = Instant::now();
        let dispersion = Arc::new(AsyncMutex::new(DispersionRecord::new()));
        let offset = Arc::new(AsyncMutex::new(WallClockOffsetLog::new()));

        let d = dispersion.clone();
        let o = offset.clone();
        let handle = tokio::spawn(async move {
            run_client_role_shared(rx, d, o, start, 0.0, converged_tx, cancel_rx).await;
        });

        for i in 0..32u64 {
            let jitter_secs = (fastrand::f64() - 0.5) * 0.002;
            tx.send(DispersionUpdate {
                at: start + Duration::from_millis(i * 10),
                dispersion_secs: (0.001 + jitter_secs).max(0.0),
                offset_secs: 0.05,
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(dispersion.lock().await.len(), 32);
        assert_eq!(offset.lock().await.at(10.0), Some(0.05));
        let _ = cancel_tx;
    }
}
