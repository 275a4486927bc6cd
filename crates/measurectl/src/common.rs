use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use measure_core::config::{ChannelMetadata, MeasurementConfig, Role, Timeouts};
use measure_core::model::{ExpectedPulseList, PulseKind, TickRate};
use measure_core::orchestrator::ChannelExpectation;

/// Arguments shared by both entry points (§6): the content-id stem and
/// timeline selector to arm against, the tick-rate the sampler's pulses are
/// expressed in, the measurement anchor, per-channel metadata files, and the
/// tolerance/duration options. Role-specific service addresses are declared
/// on each binary's own `Cli` and flattened alongside this.
#[derive(Parser, Debug)]
pub struct MeasurementArgs {
    /// Content-id stem to arm against; empty matches anything (§4.5).
    pub content_id: String,
    /// Timeline selector requested from the C4 service.
    pub timeline_selector: String,
    /// Tick-rate numerator, e.g. `1` for `1/90000`.
    pub tick_rate_num: u64,
    /// Tick-rate denominator, e.g. `90000` for `1/90000`.
    pub tick_rate_den: u64,
    /// Timeline tick corresponding to the first frame of the test video.
    pub anchor_tick: i64,

    /// Metadata file for light channel 0.
    #[arg(long = "light0", value_name = "METADATA_JSON")]
    pub light0: Option<PathBuf>,
    /// Metadata file for light channel 1.
    #[arg(long = "light1", value_name = "METADATA_JSON")]
    pub light1: Option<PathBuf>,
    /// Metadata file for audio channel 0.
    #[arg(long = "audio0", value_name = "METADATA_JSON")]
    pub audio0: Option<PathBuf>,
    /// Metadata file for audio channel 1.
    #[arg(long = "audio1", value_name = "METADATA_JSON")]
    pub audio1: Option<PathBuf>,

    /// Pass/fail tolerance, milliseconds (§4.11).
    #[arg(long = "toleranceTest", value_name = "MS")]
    pub tolerance_test_ms: u64,
    /// Requested sampling window, seconds.
    #[arg(long = "measureSecs")]
    pub measure_secs: u64,

    /// Serial device path to the sampler microcontroller (C1).
    #[arg(long)]
    pub sampler: String,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()),
        ))
        .with_target(false)
        .init();
}

/// On-disk shape of a channel's expected-pulse metadata file (§6).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    event_centre_times: Vec<f64>,
    duration_secs: u64,
    pattern_window_length: u32,
    fps: f64,
    #[serde(default)]
    #[allow(dead_code)]
    size: Option<[u32; 2]>,
    #[serde(default)]
    approx_flash_duration_secs: Option<f64>,
    #[serde(default)]
    approx_beep_duration_secs: Option<f64>,
}

fn load_expected_pulse_list(path: &PathBuf, kind: PulseKind) -> Result<ExpectedPulseList> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read metadata file {}", path.display()))?;
    let parsed: MetadataFile = serde_json::from_str(&text)
        .with_context(|| format!("parse metadata file {}", path.display()))?;
    let approx_duration_secs = match kind {
        PulseKind::Flash => parsed.approx_flash_duration_secs,
        PulseKind::Beep => parsed.approx_beep_duration_secs,
    }
    .with_context(|| {
        format!(
            "metadata file {} is missing the approx duration for this channel's pulse kind",
            path.display()
        )
    })?;
    Ok(ExpectedPulseList {
        kind,
        event_centre_times: parsed.event_centre_times,
        duration_secs: parsed.duration_secs,
        pattern_window_length: parsed.pattern_window_length,
        fps: parsed.fps,
        approx_duration_secs,
    })
}

/// Sampler channel indices by CLI option, matching the order the options are
/// listed in spec.md §6.
const LIGHT0_CHANNEL: u8 = 0;
const LIGHT1_CHANNEL: u8 = 1;
const AUDIO0_CHANNEL: u8 = 2;
const AUDIO1_CHANNEL: u8 = 3;

/// Build the channel metadata list (for [`MeasurementConfig`]) from whichever
/// `--light{0,1}`/`--audio{0,1}` options were supplied.
pub fn channel_metadata(args: &MeasurementArgs) -> (Vec<ChannelMetadata>, Vec<ChannelMetadata>) {
    let mut light = Vec::new();
    let mut audio = Vec::new();
    if let Some(path) = &args.light0 {
        light.push(ChannelMetadata {
            channel_id: LIGHT0_CHANNEL,
            path: path.clone(),
        });
    }
    if let Some(path) = &args.light1 {
        light.push(ChannelMetadata {
            channel_id: LIGHT1_CHANNEL,
            path: path.clone(),
        });
    }
    if let Some(path) = &args.audio0 {
        audio.push(ChannelMetadata {
            channel_id: AUDIO0_CHANNEL,
            path: path.clone(),
        });
    }
    if let Some(path) = &args.audio1 {
        audio.push(ChannelMetadata {
            channel_id: AUDIO1_CHANNEL,
            path: path.clone(),
        });
    }
    (light, audio)
}

/// Load every configured channel's metadata file into the
/// [`ChannelExpectation`] list the orchestrator arms (C7/C8 input).
pub fn load_channel_expectations(config: &MeasurementConfig) -> Result<Vec<ChannelExpectation>> {
    let mut channels = Vec::with_capacity(config.light_channels.len() + config.audio_channels.len());
    for meta in &config.light_channels {
        channels.push(ChannelExpectation {
            channel_id: meta.channel_id,
            list: load_expected_pulse_list(&meta.path, PulseKind::Flash)?,
        });
    }
    for meta in &config.audio_channels {
        channels.push(ChannelExpectation {
            channel_id: meta.channel_id,
            list: load_expected_pulse_list(&meta.path, PulseKind::Beep)?,
        });
    }
    Ok(channels)
}

/// Assemble the shared half of [`MeasurementConfig`]; callers fill in
/// `role`/`bind_addr`/`wc_url`/`ts_url` for their own entry point.
pub fn base_config(args: &MeasurementArgs, role: Role) -> Result<MeasurementConfig> {
    let tick_rate = TickRate::new(args.tick_rate_num, args.tick_rate_den)
        .context("tick-rate numerator and denominator must both be non-zero")?;
    let (light_channels, audio_channels) = channel_metadata(args);
    Ok(MeasurementConfig {
        role,
        content_id_stem: args.content_id.clone(),
        timeline_selector: args.timeline_selector.clone(),
        tick_rate,
        anchor_tick: args.anchor_tick,
        tolerance: Duration::from_millis(args.tolerance_test_ms),
        measure_secs: args.measure_secs,
        light_channels,
        audio_channels,
        dispersion_ceiling: Duration::from_millis(10),
        timeouts: Timeouts {
            sampling: Duration::from_secs(args.measure_secs + 15),
            ..Timeouts::default()
        },
        bind_addr: None,
        wc_url: None,
        ts_url: None,
    })
}
