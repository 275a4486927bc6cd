//! Pulse detector (C7, §4.7): a threshold-and-hysteresis edge finder over
//! per-millisecond min/max envelopes.
//!
//! Percentile thresholds are the open tunable design noted in spec §9(i);
//! 5th/95th is the default here, computed by a full sort of the derived
//! signal.

use crate::model::{Pulse, PulseKind, SampleBlock};

fn derived_signal(kind: PulseKind, blocks: &[SampleBlock]) -> Vec<f64> {
    match kind {
        PulseKind::Beep => blocks
            .iter()
            .map(|b| (b.max as f64) - (b.min as f64))
            .collect(),
        PulseKind::Flash => blocks.iter().map(|b| b.max as f64).collect(),
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * pct).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn threshold(signal: &[f64]) -> f64 {
    let mut sorted = signal.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let floor = percentile(&sorted, 0.05);
    let ceiling = percentile(&sorted, 0.95);
    (floor + ceiling) / 2.0
}

/// Detect pulses of `kind` on one channel's millisecond blocks, starting
/// at device-clock instant `block_start_us`.
///
/// Deterministic and restartable: running this twice on the same buffer
/// yields identical output (§8 "detector idempotence").
pub fn detect(
    channel_id: u8,
    kind: PulseKind,
    blocks: &[SampleBlock],
    block_start_us: f64,
    approx_duration_secs: f64,
) -> Vec<Pulse> {
    let signal = derived_signal(kind, blocks);
    if signal.len() < 2 {
        return Vec::new();
    }
    let thr = threshold(&signal);
    let hold_millis = (approx_duration_secs * 500.0).floor() as usize;
    let min_width_ms = approx_duration_secs * 1000.0 / 4.0;
    let max_width_ms = approx_duration_secs * 1000.0 * 3.0;

    let mut pulses = Vec::new();
    let mut i = 0usize;
    while i + 1 < signal.len() {
        // Scan for a rising edge.
        let Some(r) = (i..signal.len() - 1).find(|&j| signal[j] < thr && signal[j + 1] >= thr)
        else {
            break;
        };

        // Scan for a falling edge, absorbing any re-rise within
        // `hold_millis` after a candidate falling edge (hysteresis).
        let mut search_from = r + 1;
        let mut accepted_fall = None;
        loop {
            let Some(f) = (search_from..signal.len() - 1)
                .find(|&j| signal[j] >= thr && signal[j + 1] < thr)
            else {
                break;
            };
            let reabsorb_end = (f + 1 + hold_millis).min(signal.len());
            let re_rises = (f + 1..reabsorb_end).any(|j| signal[j] >= thr);
            if re_rises {
                search_from = f + 1;
                continue;
            }
            accepted_fall = Some(f);
            break;
        }

        let Some(f) = accepted_fall else {
            break;
        };

        let width_ms = (f - r) as f64;
        if width_ms >= min_width_ms && width_ms <= max_width_ms {
            let mid_instant_us = block_start_us + ((r + f) as f64 / 2.0) * 1000.0;
            let half_width_ms = (f - r) as f64 / 2.0;
            pulses.push(Pulse {
                channel_id,
                kind,
                mid_instant_us,
                half_width_ms,
            });
        }

        i = f + 1;
    }

    pulses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8, n: usize) -> Vec<SampleBlock> {
        vec![SampleBlock { min: value, max: value }; n]
    }

    fn synth_flash(baseline: u8, peak: u8, pre: usize, width: usize, post: usize) -> Vec<SampleBlock> {
        let mut blocks = flat(baseline, pre);
        blocks.extend(flat(peak, width));
        blocks.extend(flat(baseline, post));
        blocks
    }

    #[test]
    fn detects_single_isolated_flash() {
        let blocks = synth_flash(10, 200, 50, 120, 50);
        let pulses = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        assert_eq!(pulses.len(), 1);
        assert_eq!(pulses[0].kind, PulseKind::Flash);
        assert!((pulses[0].mid_instant_us - (50.0 + 60.0) * 1000.0).abs() < 2000.0);
    }

    #[test]
    fn idempotent_on_same_buffer() {
        let blocks = synth_flash(10, 200, 50, 120, 50);
        let a = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        let b = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        assert_eq!(a, b, "detector must be deterministic");
    }

    #[test]
    fn backlight_modulation_absorbed_by_hysteresis() {
        // A 120ms flash with a 3ms dip back to floor in the middle.
        let mut blocks = flat(10, 50);
        blocks.extend(flat(200, 58));
        blocks.extend(flat(10, 3));
        blocks.extend(flat(200, 59));
        blocks.extend(flat(10, 50));
        let pulses = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        assert_eq!(pulses.len(), 1, "modulation dip must not split the pulse");
    }

    #[test]
    fn rejects_too_narrow_pulse_as_noise() {
        let blocks = synth_flash(10, 200, 50, 2, 50);
        let pulses = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        assert!(pulses.is_empty());
    }

    #[test]
    fn strictly_ordered_by_mid_instant() {
        let mut blocks = synth_flash(10, 200, 20, 120, 40);
        blocks.extend(synth_flash(10, 200, 0, 120, 20));
        let pulses = detect(0, PulseKind::Flash, &blocks, 0.0, 0.12);
        assert_eq!(pulses.len(), 2);
        assert!(pulses[0].mid_instant_us < pulses[1].mid_instant_us);
    }
}
