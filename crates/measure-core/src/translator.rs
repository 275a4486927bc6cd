//! Time translator (C9, §4.9): composes the clock-offset estimator (C2),
//! the wall-clock mapping (C3, via C6's offset log), and the current
//! timeline correlation to express a device-clock instant as a timeline
//! tick with a conservative, additive error bound.

use crate::clock_offset;
use crate::error::MeasureError;
use crate::model::{ClockOffsetEstimate, Correlation, DispersionRecord, TickRate, TranslatedInstant, WallClockOffsetLog};

/// Sampling quantum (§4.9): one millisecond block resolution.
pub const SAMPLING_QUANTUM_SECS: f64 = 0.0005;
/// Device-timer quantum (§4.9): the sampler's microsecond counter.
pub const DEVICE_TIMER_QUANTUM_SECS: f64 = 0.000_001;

/// Translate a device-clock instant (microseconds) to a timeline tick.
///
/// Fails with [`MeasureError::NoTimeline`] when no non-null, non-paused
/// correlation is in effect at the translated wall-clock instant (§4.9).
#[allow(clippy::too_many_arguments)]
pub fn translate(
    device_us: u32,
    pre: &ClockOffsetEstimate,
    post: &ClockOffsetEstimate,
    offset_log: &WallClockOffsetLog,
    dispersion: &DispersionRecord,
    correlation: Option<&Correlation>,
    tick_rate: TickRate,
) -> Result<TranslatedInstant, MeasureError> {
    // Stage 1: device clock -> host wall-clock, via linear interpolation
    // between the pre/post C2 estimates. `device = host + offset(host)` is
    // affine in `host` between the two estimates, so it inverts in closed
    // form; one `interpolate` call at the inverted host then also yields
    // the conservative error bound for that instant.
    let device_secs = device_us as f64 * 1e-6;
    let offset_pre = pre.device as f64 * 1e-6 - pre.host;
    let offset_post = post.device as f64 * 1e-6 - post.host;
    let span = post.host - pre.host;
    let host_secs = if span.abs() < f64::EPSILON {
        pre.host
    } else {
        let slope = (offset_post - offset_pre) / span;
        (device_secs - offset_pre + pre.host * slope) / (1.0 + slope)
    };
    let (_, c2_bound) = clock_offset::interpolate(pre, post, host_secs);

    // Stage 2: host wall-clock -> synchronised wall-clock, via C3's current
    // filtered offset.
    let wc_offset = offset_log.at(host_secs).unwrap_or(0.0);
    let synced_wall_clock = host_secs + wc_offset;

    // Stage 3: synchronised wall-clock -> timeline tick, via the current
    // correlation.
    let correlation = correlation
        .filter(|c| !c.is_paused())
        .ok_or(MeasureError::NoTimeline)?;
    let tick = correlation.project(synced_wall_clock, tick_rate);

    let wc_dispersion = dispersion.at(synced_wall_clock).unwrap_or(0.0);
    let timeline_quantum_secs = 0.5 * tick_rate.seconds_per_tick();
    let error_bound_secs = c2_bound
        + wc_dispersion
        + timeline_quantum_secs
        + SAMPLING_QUANTUM_SECS
        + DEVICE_TIMER_QUANTUM_SECS;

    Ok(TranslatedInstant {
        tick,
        error_bound_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WallClockOffsetLog;

    fn sample_estimates() -> (ClockOffsetEstimate, ClockOffsetEstimate) {
        let pre = ClockOffsetEstimate {
            host: 0.0,
            device: 0,
            half_round_trip: 0.002,
        };
        let post = ClockOffsetEstimate {
            host: 10.0,
            device: 10_000_000,
            half_round_trip: 0.0015,
        };
        (pre, post)
    }

    #[test]
    fn fails_with_no_timeline_when_correlation_null() {
        let (pre, post) = sample_estimates();
        let offset_log = WallClockOffsetLog::new();
        let dispersion = DispersionRecord::new();
        let tick_rate = TickRate::new(1, 90_000).unwrap();
        let err = translate(5_000_000, &pre, &post, &offset_log, &dispersion, None, tick_rate)
            .unwrap_err();
        assert!(matches!(err, MeasureError::NoTimeline));
    }

    #[test]
    fn fails_with_no_timeline_when_paused() {
        let (pre, post) = sample_estimates();
        let offset_log = WallClockOffsetLog::new();
        let dispersion = DispersionRecord::new();
        let tick_rate = TickRate::new(1, 90_000).unwrap();
        let paused = Correlation {
            ref_clock_instant: 0.0,
            timeline_tick: 0,
            speed: 0.0,
        };
        let err = translate(
            5_000_000,
            &pre,
            &post,
            &offset_log,
            &dispersion,
            Some(&paused),
            tick_rate,
        )
        .unwrap_err();
        assert!(matches!(err, MeasureError::NoTimeline));
    }

    #[test]
    fn error_bound_is_conservative_sum() {
        let (pre, post) = sample_estimates();
        let mut offset_log = WallClockOffsetLog::new();
        offset_log.push(0.0, 0.0);
        let mut dispersion = DispersionRecord::new();
        dispersion.push(0.0, 0.003);
        let tick_rate = TickRate::new(1, 90_000).unwrap();
        let correlation = Correlation {
            ref_clock_instant: 0.0,
            timeline_tick: 0,
            speed: 1.0,
        };
        let result = translate(
            5_000_000,
            &pre,
            &post,
            &offset_log,
            &dispersion,
            Some(&correlation),
            tick_rate,
        )
        .unwrap();

        let c2_bound = pre.half_round_trip + post.half_round_trip;
        assert!(result.error_bound_secs >= c2_bound);
        assert!(result.error_bound_secs >= 0.003);
        assert!(result.error_bound_secs >= SAMPLING_QUANTUM_SECS);
        assert!(result.error_bound_secs >= DEVICE_TIMER_QUANTUM_SECS);
    }
}
