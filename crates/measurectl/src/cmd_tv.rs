//! Measures a television: this process plays the protocol client, dialling
//! out to the three services the device under test already runs.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use measure_core::config::Role;
use measure_core::orchestrator::{Orchestrator, ServiceHandles};
use measure_core::{map_exit_code, map_verdict_exit_code};
use sampler_link::{AsyncSamplerLink, SamplerLink};
use sync_contentid::{ContentIdClient, ContentIdRecord};
use sync_timeline::{ControlTimestampWire, TickRateWire, TimelineClient, TimelineRequest};
use sync_wallclock::WallClockClient;

use crate::common::{self, MeasurementArgs};

#[derive(Parser, Debug)]
#[command(name = "measure-tv", version, about = "Measure a television's synchronisation conformance")]
pub struct Cli {
    #[command(flatten)]
    pub common: MeasurementArgs,
    /// Address of the device's content-id service to dial.
    #[arg(long)]
    pub content_id_addr: SocketAddr,
    /// Address of the device's wall-clock service to dial.
    #[arg(long)]
    pub wc_addr: SocketAddr,
    /// Address of the device's timeline service to dial.
    #[arg(long)]
    pub ts_addr: SocketAddr,
}

/// Connect to the device's content-id service, push the first record as the
/// ARMING gate's input, then relay every subsequent record. A `watch`-based
/// relay is used at the boundary since [`ContentIdClient::run`] wants a
/// `Sender<ContentIdRecord>` but the orchestrator reads `Option<..>` (no
/// record received yet is a distinct state from an empty one).
async fn run_content_id_client(
    addr: SocketAddr,
    content_id_tx: watch::Sender<Option<ContentIdRecord>>,
    cancel: watch::Receiver<bool>,
) -> Result<()> {
    let mut client = ContentIdClient::connect(addr)
        .await
        .with_context(|| format!("connect content-id client to {addr}"))?;
    let Some(first) = client
        .first_record(cancel.clone())
        .await
        .context("await first content-id record")?
    else {
        return Ok(());
    };
    info!(content_id = %first.content_id, "content-id armed");
    let (inner_tx, mut inner_rx) = watch::channel(first.clone());
    let _ = content_id_tx.send(Some(first));
    let relay_tx = content_id_tx.clone();
    tokio::spawn(async move {
        while inner_rx.changed().await.is_ok() {
            let _ = relay_tx.send(Some(inner_rx.borrow().clone()));
        }
    });
    client
        .run(inner_tx, cancel)
        .await
        .context("content-id client session")
}

pub async fn run(cli: Cli) -> Result<i32> {
    let config = common::base_config(&cli.common, Role::Tv)?;
    let channels = common::load_channel_expectations(&config)?;

    let link = SamplerLink::open(&cli.common.sampler)
        .with_context(|| format!("open sampler link at {}", cli.common.sampler))?;
    let link = AsyncSamplerLink::new(link);

    let mut orchestrator = Orchestrator::new(config.clone());
    let cancel_tx = orchestrator.cancel_handle();

    let (content_id_tx, content_id_rx) = watch::channel(None);
    let (timeline_tx, timeline_rx) = watch::channel(ControlTimestampWire {
        content_id: String::new(),
        content_id_status: String::new(),
        presentation_status: String::new(),
        timeline_selector: String::new(),
        tick_rate: TickRateWire {
            num: config.tick_rate.num,
            den: config.tick_rate.den,
        },
        content_time: None,
        wall_clock_time: None,
        timeline_speed_multiplier: None,
    });
    let (dispersion_tx, dispersion_rx) = mpsc::channel(32);
    let (_peer_tx, peer_rx) = watch::channel(true);

    let content_id_task = tokio::spawn(run_content_id_client(
        cli.content_id_addr,
        content_id_tx,
        cancel_tx.subscribe(),
    ));

    let timeline_request = TimelineRequest {
        content_id_stem: config.content_id_stem.clone(),
        timeline_selector: config.timeline_selector.clone(),
        tick_rate: TickRateWire {
            num: config.tick_rate.num,
            den: config.tick_rate.den,
        },
    };
    let timeline_client = TimelineClient::connect(cli.ts_addr, timeline_request)
        .await
        .with_context(|| format!("connect timeline client to {}", cli.ts_addr))?;
    let timeline_task = tokio::spawn(
        timeline_client.run(timeline_tx, cancel_tx.subscribe()),
    );

    let wall_clock_client = WallClockClient::connect(cli.wc_addr)
        .await
        .with_context(|| format!("connect wall-clock client to {}", cli.wc_addr))?;
    let wall_clock_task = tokio::spawn(wall_clock_client.run(dispersion_tx, cancel_tx.subscribe()));

    let mut handles = ServiceHandles {
        content_id: content_id_rx,
        timeline: timeline_rx,
        dispersion_updates: Some(dispersion_rx),
        peer_connected: peer_rx,
    };

    let result = orchestrator.run(link, &mut handles, &channels).await;

    cancel_tx.send(true).ok();
    if let Err(err) = content_id_task.await {
        warn!(%err, "content-id client task panicked");
    }
    if let Err(err) = timeline_task.await {
        warn!(%err, "timeline client task panicked");
    }
    if let Err(err) = wall_clock_task.await {
        warn!(%err, "wall-clock client task panicked");
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
