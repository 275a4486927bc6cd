//! Measurement orchestrator (C10, §4.10): drives one measurement through
//!
//! ```text
//! IDLE -> ARMING -> WAIT_PEER -> SYNCING -> SAMPLING -> UPLOADING -> ANALYSING -> DONE
//!               \-> FAULT (from any state on unrecoverable error)
//! ```
//!
//! Coordinates C1 (sampler-link), C2 (clock_offset), C3/C4/C5 (reached only
//! through the read-only [`ServiceHandles`] the composition root hands in),
//! C6 (dispersion/offset logs), C7 (detector), C8 (correlator), C9
//! (translator), and C11 (verdict). The orchestrator never holds a
//! reference back into a service's own task (§9 "cyclic/back references"
//! redesign flag) — it only reads `watch`/`mpsc` channels populated by
//! those tasks.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sampler_link::AsyncSamplerLink;
use sampler_proto::RawSample;
use sync_contentid::ContentIdRecord;
use sync_timeline::ControlTimestampWire;
use sync_wallclock::DispersionUpdate;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock_offset;
use crate::config::{MeasurementConfig, Role};
use crate::correlator::{self, CorrelationResult};
use crate::detector;
use crate::dispersion;
use crate::error::MeasureError;
use crate::model::{Correlation, DispersionRecord, ExpectedPulseList, SampleBlock, WallClockOffsetLog};
use crate::translator;
use crate::verdict::{self, Verdict};

/// Observable orchestrator states (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Arming,
    WaitPeer,
    Syncing,
    Sampling,
    Uploading,
    Analysing,
    Done,
    Fault,
}

/// One configured measurement channel: the sampler channel index, tagged
/// with the expected-pulse metadata describing what should appear there.
#[derive(Debug, Clone)]
pub struct ChannelExpectation {
    pub channel_id: u8,
    pub list: ExpectedPulseList,
}

/// Handles to the already-running protocol services (C3/C4/C5), built by
/// the composition root (the CLI) according to the process's role. The
/// orchestrator only ever reads from these.
pub struct ServiceHandles {
    pub content_id: watch::Receiver<Option<ContentIdRecord>>,
    pub timeline: watch::Receiver<ControlTimestampWire>,
    /// `Some` in TV-measuring (protocol client) role; `None` in
    /// CSA-measuring (protocol server) role, where C6 synthesizes constant
    /// zero dispersion instead of consuming updates.
    pub dispersion_updates: Option<mpsc::Receiver<DispersionUpdate>>,
    /// Toggled by the composition root the first time a peer connects to
    /// any server-role service; consulted only in CSA-measuring mode's
    /// WAIT_PEER exit condition (§4.10).
    pub peer_connected: watch::Receiver<bool>,
}

/// Final report produced at DONE.
#[derive(Debug, Clone)]
pub struct MeasurementReport {
    pub correlation: CorrelationResult,
    pub verdict: Verdict,
    pub observed_pulses: usize,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

fn correlation_from_ct(ct: &ControlTimestampWire) -> Option<Correlation> {
    let tick = ct.content_time?;
    let wall_clock_ns = ct.wall_clock_time?;
    let speed = ct.timeline_speed_multiplier?;
    Some(Correlation {
        ref_clock_instant: wall_clock_ns as f64 * 1e-9,
        timeline_tick: tick,
        speed,
    })
}

/// Pick out one active channel's millisecond rows from the bulk buffer's
/// `[block][channel]` layout (§6) into the contiguous per-channel slice the
/// detector (C7) expects.
fn channel_blocks(raw: &[Vec<RawSample>], channel_index: usize) -> Vec<SampleBlock> {
    raw.iter()
        .map(|block| SampleBlock {
            min: block[channel_index].min,
            max: block[channel_index].max,
        })
        .collect()
}

pub struct Orchestrator {
    config: MeasurementConfig,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    state: State,
}

impl Orchestrator {
    pub fn new(config: MeasurementConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            cancel_tx,
            cancel_rx,
            state: State::Idle,
        }
    }

    /// A cloneable handle for requesting cancellation; checked at every
    /// suspension point (§5 "a single cancellation token is shared").
    pub fn cancel_handle(&self) -> watch::Sender<bool> {
        self.cancel_tx.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn enter(&mut self, state: State) {
        info!(?state, "orchestrator state transition");
        self.state = state;
    }

    fn check_cancel(&self) -> Result<(), MeasureError> {
        if *self.cancel_rx.borrow() {
            return Err(MeasureError::UserAbort);
        }
        Ok(())
    }

    async fn with_timeout<F, T>(
        &self,
        dur: Duration,
        fut: F,
        state_name: &'static str,
    ) -> Result<T, MeasureError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(dur, fut)
            .await
            .map_err(|_| MeasureError::StateTimeout { state: state_name })
    }

    /// Run one full measurement. `link` is C1's async handle; `channels`
    /// is the set of sampler channels to arm, each tagged with the
    /// expected-pulse metadata (C7/C8 input) for that channel; `handles`
    /// are the already-running C3/C4/C5 services for this process's role.
    pub async fn run(
        &mut self,
        link: AsyncSamplerLink,
        handles: &mut ServiceHandles,
        channels: &[ChannelExpectation],
    ) -> Result<MeasurementReport, MeasureError> {
        let result = self.run_inner(link, handles, channels).await;
        if result.is_err() {
            self.enter(State::Fault);
        }
        result
    }

    async fn run_inner(
        &mut self,
        link: AsyncSamplerLink,
        handles: &mut ServiceHandles,
        channels: &[ChannelExpectation],
    ) -> Result<MeasurementReport, MeasureError> {
        self.enter(State::Arming);
        self.check_cancel()?;
        self.with_timeout(
            self.config.timeouts.arming,
            wait_for_content_id(handles, &self.config.content_id_stem),
            "ARMING",
        )
        .await??;

        self.enter(State::WaitPeer);
        self.check_cancel()?;
        if self.config.role == Role::Csa {
            self.with_timeout(
                self.config.timeouts.wait_peer,
                wait_for_peer(handles),
                "WAIT_PEER",
            )
            .await?;
        }

        self.enter(State::Syncing);
        self.check_cancel()?;
        let shared_dispersion = Arc::new(AsyncMutex::new(DispersionRecord::new()));
        let shared_offset_log = Arc::new(AsyncMutex::new(WallClockOffsetLog::new()));
        let sync_start = Instant::now();
        let mut background_recorder: Option<JoinHandle<()>> = None;

        match self.config.role {
            Role::Csa => {
                shared_dispersion.lock().await.push(0.0, 0.0);
                shared_offset_log.lock().await.push(0.0, 0.0);
            }
            Role::Tv => {
                let updates = handles
                    .dispersion_updates
                    .take()
                    .expect("TV role always carries a dispersion update channel");
                let ceiling = self.config.dispersion_ceiling_secs();
                let (converged_tx, mut converged_rx) = watch::channel(false);
                let task_cancel = self.cancel_rx.clone();
                background_recorder = Some(tokio::spawn(dispersion::run_client_role_shared(
                    updates,
                    shared_dispersion.clone(),
                    shared_offset_log.clone(),
                    sync_start,
                    ceiling,
                    converged_tx,
                    task_cancel,
                )));

                let deadline = tokio::time::sleep(self.config.timeouts.syncing);
                tokio::pin!(deadline);
                loop {
                    if *converged_rx.borrow() {
                        break;
                    }
                    self.check_cancel()?;
                    tokio::select! {
                        _ = &mut deadline => {
                            let observed = shared_dispersion
                                .lock()
                                .await
                                .at(sync_start.elapsed().as_secs_f64())
                                .unwrap_or(f64::INFINITY);
                            if let Some(handle) = background_recorder.take() {
                                handle.abort();
                            }
                            return Err(MeasureError::DispersionCeiling {
                                observed_secs: observed,
                                ceiling_secs: ceiling,
                            });
                        }
                        changed = converged_rx.changed() => {
                            if changed.is_err() {
                                if let Some(handle) = background_recorder.take() {
                                    handle.abort();
                                }
                                return Err(MeasureError::ProtocolFault(
                                    "wall-clock update channel closed before dispersion converged".into(),
                                ));
                            }
                        }
                    }
                }
            }
        }

        for ch in channels {
            link.enable_channel(ch.channel_id).await?;
        }
        let pre_t0 = now_secs();
        let pre_device = link.ping().await?;
        let pre_t1 = now_secs();
        let pre_estimate = clock_offset::estimate_from_ping(pre_t0, pre_t1, pre_device);
        link.prepare().await?;

        self.enter(State::Sampling);
        self.check_cancel()?;
        let sample_ack = self
            .with_timeout(self.config.timeouts.sampling, link.sample(), "SAMPLING")
            .await??;

        let post_t0 = now_secs();
        let post_device = link.ping().await?;
        let post_t1 = now_secs();
        let post_estimate = clock_offset::estimate_from_ping(post_t0, post_t1, post_device);

        self.enter(State::Uploading);
        self.check_cancel()?;
        let raw_blocks = self
            .with_timeout(self.config.timeouts.uploading, link.bulk(), "UPLOADING")
            .await??;
        // Freeze the dispersion/offset logs: stop the background recorder and
        // snapshot its state; no further pushes past this point (§4.10
        // "buffer fully received; freeze dispersion log").
        if let Some(handle) = background_recorder.take() {
            handle.abort();
        }
        let dispersion = shared_dispersion.lock().await.clone();
        let offset_log = shared_offset_log.lock().await.clone();

        self.enter(State::Analysing);
        self.check_cancel()?;
        let active_channels = link.active_channels_snapshot();
        let block_start_us = sample_ack.start_device_time as f64;
        let tick_rate = self.config.tick_rate;
        let correlation = correlation_from_ct(&handles.timeline.borrow());

        let mut observed: Vec<(f64, f64)> = Vec::new(); // (tick, error_bound_secs)
        let mut expected: Vec<i64> = Vec::new();
        let mut max_window = 0usize;

        for ch in channels {
            let Some(idx) = active_channels.iter().position(|&c| c == ch.channel_id) else {
                continue;
            };
            let blocks = channel_blocks(&raw_blocks, idx);
            let pulses = detector::detect(
                ch.channel_id,
                ch.list.kind,
                &blocks,
                block_start_us,
                ch.list.approx_duration_secs,
            );
            for pulse in pulses {
                let translated = translator::translate(
                    pulse.mid_instant_us as u32,
                    &pre_estimate,
                    &post_estimate,
                    &offset_log,
                    &dispersion,
                    correlation.as_ref(),
                    tick_rate,
                )?;
                observed.push((translated.tick, translated.error_bound_secs));
            }
            expected.extend(ch.list.expected_ticks(self.config.anchor_tick, tick_rate));
            max_window = max_window.max(ch.list.pattern_window_length as usize);
        }

        observed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        expected.sort_unstable();

        let observed_ticks: Vec<f64> = observed.iter().map(|&(t, _)| t).collect();
        let error_bounds: Vec<f64> = observed.iter().map(|&(_, b)| b).collect();
        let observed_pulses = observed_ticks.len();

        let correlation_result = correlator::correlate(&observed_ticks, &expected, max_window)?;
        let verdict = verdict::classify(
            &correlation_result.residuals,
            &error_bounds,
            self.config.tolerance_secs(),
            correlation_result.offset,
            correlation_result.jitter,
        );

        self.enter(State::Done);
        Ok(MeasurementReport {
            correlation: correlation_result,
            verdict,
            observed_pulses,
        })
    }
}

async fn wait_for_content_id(
    handles: &mut ServiceHandles,
    stem: &str,
) -> Result<(), MeasureError> {
    loop {
        let matched = handles
            .content_id
            .borrow()
            .as_ref()
            .is_some_and(|record| record.matches_stem(stem));
        if matched {
            return Ok(());
        }
        handles
            .content_id
            .changed()
            .await
            .map_err(|_| MeasureError::ProtocolFault("content-id channel closed".into()))?;
    }
}

async fn wait_for_peer(handles: &mut ServiceHandles) -> Result<(), MeasureError> {
    loop {
        if *handles.peer_connected.borrow() {
            return Ok(());
        }
        handles
            .peer_connected
            .changed()
            .await
            .map_err(|_| MeasureError::ProtocolFault("peer-connected channel closed".into()))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::model::TickRate;

    fn test_config(role: Role) -> MeasurementConfig {
        MeasurementConfig {
            role,
            content_id_stem: String::new(),
            timeline_selector: "sel".into(),
            tick_rate: TickRate::new(1, 90_000).unwrap(),
            anchor_tick: 0,
            tolerance: Duration::from_millis(10),
            measure_secs: 10,
            light_channels: Vec::new(),
            audio_channels: Vec::new(),
            dispersion_ceiling: Duration::from_millis(10),
            timeouts: Timeouts {
                syncing: Duration::from_millis(300),
                ..Default::default()
            },
            bind_addr: None,
            wc_url: None,
            ts_url: None,
        }
    }

    #[test]
    fn csa_role_config_builds() {
        let config = test_config(Role::Csa);
        assert_eq!(config.role, Role::Csa);
    }

    #[tokio::test]
    async fn wait_for_content_id_matches_prefix_stem() {
        let record = ContentIdRecord {
            protocol_version: "1.1".into(),
            content_id: "dvb://1234.abcd".into(),
            presentation_status: "okay".into(),
            wc_url: "udp://h:1".into(),
            ts_url: "tcp://h:2".into(),
        };
        let (content_tx, content_rx) = watch::channel(None);
        let (timeline_tx, timeline_rx) = watch::channel(ControlTimestampWire {
            content_id: String::new(),
            content_id_status: String::new(),
            presentation_status: String::new(),
            timeline_selector: String::new(),
            tick_rate: sync_timeline::TickRateWire { num: 1, den: 90_000 },
            content_time: None,
            wall_clock_time: None,
            timeline_speed_multiplier: None,
        });
        let (_peer_tx, peer_rx) = watch::channel(false);
        let mut handles = ServiceHandles {
            content_id: content_rx,
            timeline: timeline_rx,
            dispersion_updates: None,
            peer_connected: peer_rx,
        };

        content_tx.send(Some(record)).unwrap();
        wait_for_content_id(&mut handles, "dvb://1234")
            .await
            .unwrap();
        let _ = timeline_tx;
    }
}
