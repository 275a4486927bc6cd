//! Clock-offset estimator (C2, §4.2): request/response pings against the
//! sampler link produce an interval estimate of `device - host`, bracketed
//! by a pre- and a post-sampling estimate.

use crate::model::ClockOffsetEstimate;

/// Issue one ping exchange and derive a [`ClockOffsetEstimate`] from the
/// host instants bracketing it.
///
/// `host_before`/`host_after` are wall-clock seconds captured immediately
/// before sending the ping and immediately after its universal timestamp
/// has been fully read; `device_us` is that timestamp.
pub fn estimate_from_ping(host_before: f64, host_after: f64, device_us: u32) -> ClockOffsetEstimate {
    ClockOffsetEstimate {
        host: (host_before + host_after) / 2.0,
        device: device_us,
        half_round_trip: (host_after - host_before) / 2.0,
    }
}

/// Linear interpolation of the device-clock offset between two bracketing
/// estimates, plus the conservative error bound `hrt0 + hrt1` (§4.2).
///
/// `host` must lie in `[pre.host, post.host]` for interpolation to be
/// meaningful; values outside the bracket are clamped rather than
/// extrapolated, since the estimator makes no claim beyond its bracket.
pub fn interpolate(pre: &ClockOffsetEstimate, post: &ClockOffsetEstimate, host: f64) -> (f64, f64) {
    let span = post.host - pre.host;
    let frac = if span.abs() < f64::EPSILON {
        0.0
    } else {
        ((host - pre.host) / span).clamp(0.0, 1.0)
    };

    let offset_pre = pre.device as f64 * 1e-6 - pre.host;
    let offset_post = post.device as f64 * 1e-6 - post.host;
    let offset = offset_pre + frac * (offset_post - offset_pre);

    let bound = pre.half_round_trip + post.half_round_trip;
    (offset, bound)
}
