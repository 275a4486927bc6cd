//! Verdict reporter (C11, §4.11): classifies per-pulse residuals against a
//! configured tolerance and produces the overall pass/fail call.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseVerdict {
    pub residual_secs: f64,
    pub error_bound_secs: f64,
    pub in_tolerance: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub pulses: Vec<PulseVerdict>,
    pub pass: bool,
    pub offset_secs: f64,
    pub jitter_secs: f64,
}

/// Classify `residuals` (paired with their per-pulse error bounds) against
/// `tolerance_secs`: in-tolerance iff `|r_i| - b_i <= tolerance` (§4.11).
/// Overall verdict passes iff every pulse passes.
pub fn classify(
    residuals: &[f64],
    error_bounds: &[f64],
    tolerance_secs: f64,
    offset_secs: f64,
    jitter_secs: f64,
) -> Verdict {
    let pulses: Vec<PulseVerdict> = residuals
        .iter()
        .zip(error_bounds.iter())
        .map(|(&r, &b)| PulseVerdict {
            residual_secs: r,
            error_bound_secs: b,
            in_tolerance: r.abs() - b <= tolerance_secs,
        })
        .collect();
    let pass = pulses.iter().all(|p| p.in_tolerance);
    Verdict {
        pulses,
        pass,
        offset_secs,
        jitter_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_when_all_pulses_within_tolerance() {
        let verdict = classify(&[0.002, -0.003], &[0.001, 0.001], 0.008, 0.0014, 0.0005);
        assert!(verdict.pass);
        assert!(verdict.pulses.iter().all(|p| p.in_tolerance));
    }

    #[test]
    fn fails_when_one_pulse_exceeds_tolerance() {
        let verdict = classify(&[0.030, 0.031], &[0.001, 0.001], 0.010, 0.0305, 0.0005);
        assert!(!verdict.pass);
    }

    #[test]
    fn error_bound_is_subtracted_before_tolerance_check() {
        // Residual 15ms with a 6ms bound: |15-6| = 9ms, passes a 23ms tolerance.
        let verdict = classify(&[0.015], &[0.006], 0.023, 0.015, 0.0);
        assert!(verdict.pass);
    }
}
