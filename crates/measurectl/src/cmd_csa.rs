//! Measures a companion-screen app: this process plays the protocol server,
//! waiting for the device under test to dial in. Its own ground truth
//! (content-id, timeline correlation) is known upfront, so the orchestrator
//! reads it directly rather than looping back through the network.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use measure_core::config::Role;
use measure_core::orchestrator::{Orchestrator, ServiceHandles};
use measure_core::{map_exit_code, map_verdict_exit_code};
use sampler_link::{AsyncSamplerLink, SamplerLink};
use sync_contentid::{ContentIdRecord, ContentIdServer};
use sync_timeline::{ControlTimestampWire, CorrelationPoint, TickRateWire, TimelineServer, TimelineState};
use sync_wallclock::WallClockServer;

use crate::common::{self, MeasurementArgs};

#[derive(Parser, Debug)]
#[command(name = "measure-csa", version, about = "Measure a companion-screen app's synchronisation conformance")]
pub struct Cli {
    #[command(flatten)]
    pub common: MeasurementArgs,
    /// Address to bind the content-id service on.
    #[arg(long)]
    pub content_id_bind: SocketAddr,
    /// Address to bind the wall-clock service on.
    #[arg(long)]
    pub wc_bind: SocketAddr,
    /// Address to bind the timeline service on.
    #[arg(long)]
    pub ts_bind: SocketAddr,
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub async fn run(cli: Cli) -> Result<i32> {
    let config = common::base_config(&cli.common, Role::Csa)?;
    let channels = common::load_channel_expectations(&config)?;

    let link = SamplerLink::open(&cli.common.sampler)
        .with_context(|| format!("open sampler link at {}", cli.common.sampler))?;
    let link = AsyncSamplerLink::new(link);

    let mut orchestrator = Orchestrator::new(config.clone());
    let cancel_tx = orchestrator.cancel_handle();

    let wall_clock_server = WallClockServer::bind(cli.wc_bind)
        .await
        .with_context(|| format!("bind wall-clock server on {}", cli.wc_bind))?;
    let wc_addr = wall_clock_server.local_addr()?;

    let t0_ns = now_ns();
    let timeline_state = TimelineState {
        content_id: config.content_id_stem.clone(),
        content_id_status: "final".into(),
        presentation_status: "okay".into(),
        correlation: Some(CorrelationPoint {
            ref_clock_instant_ns: t0_ns,
            timeline_tick: config.anchor_tick,
            speed: 1.0,
        }),
    };
    let (_timeline_state_tx, timeline_state_rx) = watch::channel(timeline_state);
    let mut timeline_server = TimelineServer::bind(cli.ts_bind, timeline_state_rx)
        .await
        .with_context(|| format!("bind timeline server on {}", cli.ts_bind))?;
    let ts_addr = timeline_server.local_addr()?;

    let content_id_record = ContentIdRecord {
        protocol_version: "1.1".into(),
        content_id: config.content_id_stem.clone(),
        presentation_status: "okay".into(),
        wc_url: format!("udp://{wc_addr}"),
        ts_url: format!("tcp://{ts_addr}"),
    };
    let (_content_id_state_tx, content_id_state_rx) = watch::channel(content_id_record.clone());
    let mut content_id_server = ContentIdServer::bind(cli.content_id_bind, content_id_state_rx)
        .await
        .with_context(|| format!("bind content-id server on {}", cli.content_id_bind))?;

    let (peer_tx, peer_rx) = watch::channel(false);
    // Neither sender is used again: our own ground truth never changes
    // mid-measurement, unlike the watch channels fed by a real peer.
    let (_content_id_tx, content_id_rx) = watch::channel(Some(content_id_record));
    let (_timeline_tx, timeline_rx) = watch::channel(ControlTimestampWire {
        content_id: config.content_id_stem.clone(),
        content_id_status: "final".into(),
        presentation_status: "okay".into(),
        timeline_selector: config.timeline_selector.clone(),
        tick_rate: TickRateWire {
            num: config.tick_rate.num,
            den: config.tick_rate.den,
        },
        content_time: Some(config.anchor_tick),
        wall_clock_time: Some(t0_ns),
        timeline_speed_multiplier: Some(1.0),
    });
    let wall_clock_cancel = cancel_tx.subscribe();
    let wall_clock_task = tokio::spawn(async move { wall_clock_server.serve(wall_clock_cancel).await });
    let timeline_cancel = cancel_tx.subscribe();
    let timeline_task = tokio::spawn(async move { timeline_server.serve(timeline_cancel).await });
    let content_id_cancel = cancel_tx.subscribe();
    let content_id_task = tokio::spawn(async move {
        content_id_server
            .serve_with_peer_signal(content_id_cancel, peer_tx)
            .await
    });

    let mut handles = ServiceHandles {
        content_id: content_id_rx,
        timeline: timeline_rx,
        dispersion_updates: None,
        peer_connected: peer_rx,
    };

    let result = orchestrator.run(link, &mut handles, &channels).await;

    cancel_tx.send(true).ok();
    if let Err(err) = wall_clock_task.await {
        warn!(%err, "wall-clock server task panicked");
    }
    if let Err(err) = timeline_task.await {
        warn!(%err, "timeline server task panicked");
    }
    if let Err(err) = content_id_task.await {
        warn!(%err, "content-id server task panicked");
    }

    match result {
        Ok(report) => {
            info!(
                pass = report.verdict.pass,
                observed = report.observed_pulses,
                offset_ms = report.verdict.offset_secs * 1000.0,
                jitter_ms = report.verdict.jitter_secs * 1000.0,
                "measurement complete"
            );
            Ok(map_verdict_exit_code(&report.verdict))
        }
        Err(err) => {
            warn!(%err, "measurement failed");
            Ok(map_exit_code(&err))
        }
    }
}
