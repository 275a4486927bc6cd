//! Sequence correlator (C8, §4.8): finds the offset aligning an observed
//! pulse train to the canonical maximal-length sequence, minimizing
//! population variance of the per-pulse residual.

use crate::error::MeasureError;

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub offset_k: usize,
    /// Mean residual, `O[i] - E[i+k]`.
    pub offset: f64,
    /// `sqrt(population variance)` of the residuals at the chosen offset.
    pub jitter: f64,
    /// Per-pulse residuals at the chosen offset, in observation order.
    pub residuals: Vec<f64>,
}

fn population_variance(values: &[f64], mean: f64) -> f64 {
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    sum_sq / values.len() as f64
}

/// Align `observed` (length `N`) against `expected` (length `M >= N`),
/// searching every offset `k in [0, M-N]` for the one minimizing the
/// population variance of the residuals (§4.8).
///
/// `pattern_window_length` is the maximal-length-sequence window `N`
/// (spec's `patternWindowLength`, distinct from `observed.len()`): fewer
/// observations than this cannot uniquely identify position in the
/// sequence, and the precondition fails with
/// [`MeasureError::InsufficientObservations`].
pub fn correlate(
    observed: &[f64],
    expected: &[i64],
    pattern_window_length: usize,
) -> Result<CorrelationResult, MeasureError> {
    let n = observed.len();
    if n < pattern_window_length {
        return Err(MeasureError::InsufficientObservations {
            found: n,
            needed: pattern_window_length,
        });
    }
    if expected.len() < n {
        return Err(MeasureError::InsufficientObservations {
            found: expected.len(),
            needed: n,
        });
    }

    let max_k = expected.len() - n;
    let mut best: Option<(usize, f64, f64, Vec<f64>)> = None;

    for k in 0..=max_k {
        let residuals: Vec<f64> = observed
            .iter()
            .enumerate()
            .map(|(i, &o)| o - expected[i + k] as f64)
            .collect();
        let mean = residuals.iter().sum::<f64>() / n as f64;
        let variance = population_variance(&residuals, mean);

        let better = match &best {
            None => true,
            Some((_, best_var, best_mean, _)) => {
                if (variance - *best_var).abs() > f64::EPSILON {
                    variance < *best_var
                } else {
                    mean.abs() < best_mean.abs()
                }
            }
        };
        if better {
            best = Some((k, variance, mean, residuals));
        }
    }

    let (k, variance, mean, residuals) = best.expect("max_k >= 0 guarantees one iteration");
    Ok(CorrelationResult {
        offset_k: k,
        offset: mean,
        jitter: variance.sqrt(),
        residuals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_fewer_observations_than_window() {
        let err = correlate(&[1.0, 2.0], &[1, 2, 3, 4, 5], 7).unwrap_err();
        assert!(matches!(err, MeasureError::InsufficientObservations { .. }));
    }

    #[test]
    fn finds_exact_offset_with_no_noise() {
        let expected: Vec<i64> = (0..20).map(|i| i * 90_000).collect();
        let k_star = 5usize;
        let observed: Vec<f64> = expected[k_star..k_star + 7].iter().map(|&e| e as f64).collect();
        let result = correlate(&observed, &expected, 7).unwrap();
        assert_eq!(result.offset_k, k_star);
        assert!(result.offset.abs() < 1e-6);
        assert!(result.jitter < 1e-6);
    }

    #[test]
    fn converges_to_true_offset_as_noise_shrinks() {
        let expected: Vec<i64> = (0..20).map(|i| i * 90_000).collect();
        let k_star = 5usize;
        let constant_shift = 3.0;

        for &sigma in &[10.0, 1.0, 0.01] {
            let observed: Vec<f64> = expected[k_star..k_star + 7]
                .iter()
                .enumerate()
                .map(|(i, &e)| {
                    let jitter = if sigma > 0.01 {
                        ((i as f64 * 37.0).sin()) * sigma
                    } else {
                        0.0
                    };
                    e as f64 + constant_shift + jitter
                })
                .collect();
            let result = correlate(&observed, &expected, 7).unwrap();
            if sigma <= 0.01 {
                assert_eq!(result.offset_k, k_star);
                assert!((result.offset - constant_shift).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn detects_misaligned_constant_lag() {
        let expected: Vec<i64> = (0..20).map(|i| i * 90_000).collect();
        let k_star = 2usize;
        let lag_ticks = -2_700.0; // 30ms at 90kHz
        let observed: Vec<f64> = expected[k_star..k_star + 7]
            .iter()
            .map(|&e| e as f64 + lag_ticks)
            .collect();
        let result = correlate(&observed, &expected, 7).unwrap();
        assert_eq!(result.offset_k, k_star);
        assert!((result.offset - lag_ticks).abs() < 1e-6);
    }
}
