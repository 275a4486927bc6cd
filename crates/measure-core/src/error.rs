//! Error taxonomy (§7). `measure-core` is the single site that maps the
//! transport-level errors of `sampler-link`/`sync-wallclock`/
//! `sync-timeline`/`sync-contentid` into the measurement's own fault
//! kinds; `measurectl` is the single site that further maps those into
//! exit codes (§9 "exception-driven control flow" redesign flag).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeasureError {
    /// Serial framing or read failure talking to the sampler (§4.1, §7).
    #[error("link fault: {0}")]
    LinkFault(String),

    /// Unexpected termination or malformed frame on a protocol service
    /// (wall-clock, timeline, or content-id).
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// Translation requested while the correlation is null or paused
    /// (§4.9).
    #[error("no timeline available for translation")]
    NoTimeline,

    /// Fewer pulses detected than `patternWindowLength` (§4.8).
    #[error("insufficient observations: found {found}, need at least {needed}")]
    InsufficientObservations { found: usize, needed: usize },

    /// Wall-clock dispersion stayed above the configured ceiling for the
    /// bounded retry interval at SYNCING entry (§4.10, §7).
    #[error("dispersion ceiling exceeded: {observed_secs}s > {ceiling_secs}s")]
    DispersionCeiling {
        observed_secs: f64,
        ceiling_secs: f64,
    },

    /// Cancellation from the operator (§5).
    #[error("aborted by operator")]
    UserAbort,

    /// An orchestrator transition exceeded its configured timeout (§4.10).
    #[error("timed out waiting to leave state {state}")]
    StateTimeout { state: &'static str },
}

impl From<sampler_link::SamplerLinkError> for MeasureError {
    fn from(err: sampler_link::SamplerLinkError) -> Self {
        MeasureError::LinkFault(err.to_string())
    }
}

impl From<sync_wallclock::WallClockError> for MeasureError {
    fn from(err: sync_wallclock::WallClockError) -> Self {
        MeasureError::ProtocolFault(err.to_string())
    }
}

impl From<sync_timeline::TimelineError> for MeasureError {
    fn from(err: sync_timeline::TimelineError) -> Self {
        MeasureError::ProtocolFault(err.to_string())
    }
}

impl From<sync_contentid::ContentIdError> for MeasureError {
    fn from(err: sync_contentid::ContentIdError) -> Self {
        MeasureError::ProtocolFault(err.to_string())
    }
}
