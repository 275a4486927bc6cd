//! Data model (§3): tick-rates, correlations, control timestamps, dispersion
//! records, clock-offset estimates, sample blocks, pulses, and the
//! measurement anchor that ties a metadata file to a timeline.

use std::time::{Duration, SystemTime};

/// Timeline ticks per second, as an exact positive rational (e.g. `1/90000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    pub num: u64,
    pub den: u64,
}

impl TickRate {
    pub fn new(num: u64, den: u64) -> Option<Self> {
        if num == 0 || den == 0 {
            None
        } else {
            Some(Self { num, den })
        }
    }

    /// Ticks per second as a float, for error-bound arithmetic only.
    /// `1/90000` means 90 kHz, so this is `den/num`, not `num/den`.
    pub fn as_f64(&self) -> f64 {
        self.den as f64 / self.num as f64
    }

    /// Seconds per tick.
    pub fn seconds_per_tick(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

/// The affine map from reference-clock (wall-clock) seconds to timeline
/// ticks. `speed == 0.0` encodes a paused timeline. `None` is the "null
/// correlation": no timeline is currently available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    /// Reference clock instant, seconds since an implementation epoch.
    pub ref_clock_instant: f64,
    /// Timeline tick at `ref_clock_instant`.
    pub timeline_tick: i64,
    /// Tick rate multiplier; 0.0 when the timeline is paused.
    pub speed: f64,
}

impl Correlation {
    pub fn is_paused(&self) -> bool {
        self.speed == 0.0
    }

    /// Project this correlation to the timeline tick at `wall_clock_instant`,
    /// given the nominal tick rate.
    pub fn project(&self, wall_clock_instant: f64, tick_rate: TickRate) -> f64 {
        self.timeline_tick as f64
            + (wall_clock_instant - self.ref_clock_instant) * tick_rate.as_f64() * self.speed
    }
}

/// A correlation plus the content-id it was received for. Successive CTs
/// form a monotone sequence by arrival; only the latest is authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTimestamp {
    pub content_id: String,
    pub tick_rate: TickRate,
    /// `None` is the null CT: timeline unavailable.
    pub correlation: Option<Correlation>,
}

/// A time-ordered, append-only log of `(wallClockInstant, dispersionSeconds)`
/// points: a piecewise-constant upper bound on wall-clock uncertainty.
/// Dispersion is always non-negative; see invariant (b) in §3.
#[derive(Debug, Clone, Default)]
pub struct DispersionRecord {
    points: Vec<(f64, f64)>,
}

impl DispersionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Callers are responsible for timestamping at receipt
    /// (§5 ordering guarantee (b)); out-of-order appends are rejected.
    pub fn push(&mut self, wall_clock_instant: f64, dispersion_secs: f64) {
        debug_assert!(dispersion_secs >= 0.0, "dispersion must be non-negative");
        if let Some(&(last_instant, _)) = self.points.last() {
            if wall_clock_instant < last_instant {
                return;
            }
        }
        self.points.push((wall_clock_instant, dispersion_secs));
    }

    /// Value at or before `w`, or the earliest record if `w` precedes all of
    /// them. `None` only when no record has ever been pushed.
    pub fn at(&self, w: f64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        match self.points.partition_point(|&(t, _)| t <= w) {
            0 => Some(self.points[0].1),
            idx => Some(self.points[idx - 1].1),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A time-ordered, append-only log of filtered wall-clock offset samples,
/// held between updates the same way [`DispersionRecord`] holds its last
/// value (§3 invariant (b); SPEC_FULL §4.1-4.11 extends this discipline to
/// the offset filter, by analogy with NTP holding the last good offset
/// across a lost poll).
#[derive(Debug, Clone, Default)]
pub struct WallClockOffsetLog {
    points: Vec<(f64, f64)>,
}

impl WallClockOffsetLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, wall_clock_instant: f64, offset_secs: f64) {
        if let Some(&(last_instant, _)) = self.points.last() {
            if wall_clock_instant < last_instant {
                return;
            }
        }
        self.points.push((wall_clock_instant, offset_secs));
    }

    /// Offset at or before `w`, or the earliest record if `w` precedes all.
    pub fn at(&self, w: f64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        match self.points.partition_point(|&(t, _)| t <= w) {
            0 => Some(self.points[0].1),
            idx => Some(self.points[idx - 1].1),
        }
    }
}

/// `(host, device, halfRoundTrip)`: an estimate of `device - host`, with
/// `half_round_trip` bounding its uncertainty (§4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffsetEstimate {
    /// Host wall-clock seconds at which the estimate was taken.
    pub host: f64,
    /// Device-clock microseconds reported in the same exchange.
    pub device: u32,
    /// Half the measured round-trip, in seconds; always non-negative.
    pub half_round_trip: f64,
}

/// One kind of physical pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Flash,
    Beep,
}

/// A detected event: `(channelId, midInstant, halfWidth, kind)` in the
/// device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub channel_id: u8,
    pub kind: PulseKind,
    /// Device-clock microseconds of the pulse midpoint.
    pub mid_instant_us: f64,
    /// Half the rising-to-falling interval, in milliseconds.
    pub half_width_ms: f64,
}

/// A per-active-channel `(min, max)` pair for one millisecond of sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBlock {
    pub min: u8,
    pub max: u8,
}

/// One capture: an ordered sequence of per-channel blocks, plus the
/// device-clock instants bracketing the capture window.
#[derive(Debug, Clone)]
pub struct Capture {
    pub start_device_us: u32,
    pub end_device_us: u32,
    /// `blocks[channel][millisecond_index]`.
    pub blocks: Vec<Vec<SampleBlock>>,
}

/// Metadata describing the canonical test sequence for one channel kind
/// (§6 metadata file; §3 "expected pulse list").
#[derive(Debug, Clone)]
pub struct ExpectedPulseList {
    pub kind: PulseKind,
    /// Centre times, seconds from sequence start.
    pub event_centre_times: Vec<f64>,
    pub duration_secs: u64,
    pub pattern_window_length: u32,
    pub fps: f64,
    pub approx_duration_secs: f64,
}

impl ExpectedPulseList {
    /// Expected timeline ticks for every pulse, given the measurement
    /// anchor (the tick corresponding to the first frame of the test
    /// video) and the nominal tick rate.
    pub fn expected_ticks(&self, anchor_tick: i64, tick_rate: TickRate) -> Vec<i64> {
        self.event_centre_times
            .iter()
            .map(|&t| anchor_tick + (t * tick_rate.as_f64()).round() as i64)
            .collect()
    }
}

/// The timeline tick declared to correspond to the first frame of the test
/// video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementAnchor {
    pub first_frame_tick: i64,
}

/// A translated instant: a timeline tick with its conservative, additive
/// error bound (§3 invariant (c), §4.9).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslatedInstant {
    pub tick: f64,
    /// Seconds; always non-negative, always the sum (not max) of
    /// contributing uncertainties.
    pub error_bound_secs: f64,
}

/// Converts a `SystemTime` to seconds since `UNIX_EPOCH`, for uses that need
/// a plain `f64` wall-clock instant (matching the `f64`-seconds internal
/// representation used throughout C2/C3/C9).
pub fn system_time_to_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_rate_conversions() {
        let tr = TickRate::new(1, 90_000).unwrap();
        assert!((tr.as_f64() - 90_000.0).abs() < 1e-9);
        assert!((tr.seconds_per_tick() - 1.0 / 90_000.0).abs() < 1e-12);
    }

    #[test]
    fn correlation_projects_with_speed() {
        let corr = Correlation {
            ref_clock_instant: 100.0,
            timeline_tick: 900_000,
            speed: 1.0,
        };
        let tr = TickRate::new(1, 90_000).unwrap();
        let tick = corr.project(100.001, tr);
        assert!((tick - (900_000.0 + 90.0)).abs() < 1e-6);
    }

    #[test]
    fn paused_correlation_has_zero_speed() {
        let corr = Correlation {
            ref_clock_instant: 0.0,
            timeline_tick: 0,
            speed: 0.0,
        };
        assert!(corr.is_paused());
    }

    #[test]
    fn dispersion_lookup_returns_earliest_before_first_record() {
        let mut rec = DispersionRecord::new();
        rec.push(10.0, 0.002);
        rec.push(20.0, 0.004);
        rec.push(30.0, 0.006);
        assert_eq!(rec.at(5.0), Some(0.002));
        assert_eq!(rec.at(10.0), Some(0.002));
        assert_eq!(rec.at(25.0), Some(0.004));
        assert_eq!(rec.at(100.0), Some(0.006));
    }

    #[test]
    fn dispersion_lookup_empty_is_none() {
        let rec = DispersionRecord::new();
        assert_eq!(rec.at(0.0), None);
    }

    #[test]
    fn expected_ticks_follow_anchor_and_rate() {
        let list = ExpectedPulseList {
            kind: PulseKind::Flash,
            event_centre_times: vec![0.0, 1.0, 2.0],
            duration_secs: 7,
            pattern_window_length: 3,
            fps: 25.0,
            approx_duration_secs: 0.12,
        };
        let tr = TickRate::new(1, 90_000).unwrap();
        let ticks = list.expected_ticks(1_000, tr);
        assert_eq!(ticks, vec![1_000, 91_000, 181_000]);
    }
}
