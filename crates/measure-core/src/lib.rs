//! Synchronisation-conformance measurement pipeline.
//!
//! Glues the three-protocol synchronisation stack, the sampler microcontroller's
//! clock-offset estimation, pulse detection, and maximal-length-sequence
//! correlation into one measurable quantity: a per-pulse signed timing error,
//! an aggregate ahead/behind offset, and a pass/fail verdict.
//!
//! ```rust,no_run
//! use measure_core::config::MeasurementConfig;
//! use measure_core::orchestrator::{ChannelExpectation, Orchestrator, ServiceHandles};
//! use sampler_link::{AsyncSamplerLink, SamplerLink};
//!
//! # async fn run(
//! #     config: MeasurementConfig,
//! #     link: SamplerLink,
//! #     mut handles: ServiceHandles,
//! #     channels: Vec<ChannelExpectation>,
//! # ) -> Result<(), measure_core::error::MeasureError> {
//! let mut orchestrator = Orchestrator::new(config);
//! let link = AsyncSamplerLink::new(link);
//! let report = orchestrator.run(link, &mut handles, &channels).await?;
//! println!("pass = {}", report.verdict.pass);
//! # Ok(())
//! # }
//! ```

pub mod clock_offset;
pub mod config;
pub mod correlator;
pub mod detector;
pub mod dispersion;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod translator;
pub mod verdict;

pub use config::{ChannelMetadata, MeasurementConfig, Role, Timeouts};
pub use error::MeasureError;
pub use orchestrator::{ChannelExpectation, MeasurementReport, Orchestrator, ServiceHandles, State};
pub use verdict::{PulseVerdict, Verdict};

/// Maps a [`MeasureError`] to the process exit code specified in spec §6.
/// The single translation site from the error taxonomy (§7) to an exit
/// status; the orchestrator and every CLI entry point share it so the two
/// never drift (§9 "exception-driven control flow" redesign flag).
pub fn map_exit_code(err: &MeasureError) -> i32 {
    match err {
        MeasureError::LinkFault(_) => 2,
        MeasureError::ProtocolFault(_) => 2,
        MeasureError::NoTimeline => 2,
        MeasureError::DispersionCeiling { .. } => 2,
        MeasureError::InsufficientObservations { .. } => 3,
        MeasureError::UserAbort => 4,
        MeasureError::StateTimeout { .. } => 2,
    }
}

/// Exit code for a completed, verdict-bearing measurement: 0 if every pulse
/// passed, 1 otherwise. `out-of-tolerance` is a verdict, not an `Err` (§7).
pub fn map_verdict_exit_code(verdict: &Verdict) -> i32 {
    if verdict.pass {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(
            map_exit_code(&MeasureError::InsufficientObservations {
                found: 2,
                needed: 7
            }),
            3
        );
        assert_eq!(map_exit_code(&MeasureError::UserAbort), 4);
        assert_eq!(map_exit_code(&MeasureError::NoTimeline), 2);
        assert_eq!(
            map_exit_code(&MeasureError::LinkFault("short read".into())),
            2
        );
    }

    #[test]
    fn verdict_exit_code_follows_pass_fail() {
        let pass = verdict::classify(&[0.001], &[0.0], 0.01, 0.001, 0.0);
        assert_eq!(map_verdict_exit_code(&pass), 0);
        let fail = verdict::classify(&[0.030], &[0.0], 0.01, 0.030, 0.0);
        assert_eq!(map_verdict_exit_code(&fail), 1);
    }
}
