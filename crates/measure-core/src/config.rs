//! Measurement configuration (§4.12): a single struct built once from
//! parsed CLI arguments and passed explicitly to every component at
//! construction. No global or thread-local configuration state exists
//! anywhere in this workspace.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::TickRate;

/// Which side of the measurement this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Measuring a television: this process is the protocol client,
    /// dialling out to the device under test.
    Tv,
    /// Measuring a companion-screen application: this process is the
    /// protocol server, waited on by the device under test.
    Csa,
}

/// Per-transition timeouts for the orchestrator state machine (§4.10, §5).
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub arming: Duration,
    pub wait_peer: Duration,
    pub syncing: Duration,
    pub sampling: Duration,
    pub uploading: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            arming: Duration::from_secs(5),
            wait_peer: Duration::from_secs(30),
            syncing: Duration::from_secs(20),
            sampling: Duration::from_secs(60),
            uploading: Duration::from_secs(10),
        }
    }
}

/// Path to a channel's metadata file, tagged with the pulse kind it
/// describes.
#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    pub channel_id: u8,
    pub path: PathBuf,
}

/// Everything needed to run one measurement, built once by the CLI and
/// shared by reference thereafter (§9 "global singletons" redesign flag).
#[derive(Debug, Clone)]
pub struct MeasurementConfig {
    pub role: Role,
    pub content_id_stem: String,
    pub timeline_selector: String,
    pub tick_rate: TickRate,
    pub anchor_tick: i64,
    pub tolerance: Duration,
    pub measure_secs: u64,
    pub light_channels: Vec<ChannelMetadata>,
    pub audio_channels: Vec<ChannelMetadata>,
    /// Dispersion ceiling for TV-measuring mode's WAIT_PEER → SYNCING
    /// transition (§4.10, §7 dispersion-ceiling).
    pub dispersion_ceiling: Duration,
    pub timeouts: Timeouts,
    /// Server role bind address, or client role peer address, depending on
    /// `role` and the service in question.
    pub bind_addr: Option<SocketAddr>,
    pub wc_url: Option<SocketAddr>,
    pub ts_url: Option<SocketAddr>,
}

impl MeasurementConfig {
    /// Dispersion bound expressed in seconds, for use in C6/C9 arithmetic.
    pub fn dispersion_ceiling_secs(&self) -> f64 {
        self.dispersion_ceiling.as_secs_f64()
    }

    /// Tolerance expressed in seconds, for use in C11.
    pub fn tolerance_secs(&self) -> f64 {
        self.tolerance.as_secs_f64()
    }
}
