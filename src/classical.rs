//! Classical estimator: Monte-Carlo simulation of correlated daily returns
//! under the variant's covariance matrix.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::{MC_BATCH_SIZE, MC_CONVERGENCE_TOL, MC_SAMPLES};
use crate::kernel;
use crate::model::Portfolio;
use crate::result::nan_null;

/// One completed Monte-Carlo point.
#[derive(Clone, Copy, Debug)]
pub struct ClassicalPoint {
    pub sigma_daily: f64,
    pub non_psd: bool,
    /// Fraction of running-volatility checkpoints within tolerance of the
    /// final estimate.
    pub convergence_rate: f64,
    /// Uncorrelated-sum variance over empirical variance, clamped to [0, 1].
    pub efficiency: f64,
    pub standard_error: f64,
    pub samples_drawn: usize,
}

/// Mode-specific analytics for a classical run, aggregated over all
/// completed steps.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassicalMetrics {
    #[serde(with = "nan_null")]
    pub simulations_per_second: f64,
    #[serde(with = "nan_null")]
    pub iterations_per_second: f64,
    #[serde(with = "nan_null")]
    pub convergence_rate: f64,
    #[serde(with = "nan_null")]
    pub monte_carlo_efficiency: f64,
    #[serde(with = "nan_null")]
    pub standard_error: f64,
    pub samples_per_step: usize,
}

/// Draws `MC_SAMPLES` correlated return samples and returns the empirical
/// daily volatility. Returns `None` when cancellation fires mid-point (the
/// point is then not part of the run's results). A non-PSD covariance
/// produces a flagged NaN point without sampling.
pub fn simulate_volatility(
    portfolio: &Portfolio,
    seed: u64,
    cancel: &CancelToken,
) -> Option<ClassicalPoint> {
    let sigma = kernel::covariance_matrix(portfolio);
    let Some(factor) = correlation_factor(&sigma) else {
        debug!("covariance not PSD; emitting NaN point");
        return Some(ClassicalPoint {
            sigma_daily: f64::NAN,
            non_psd: true,
            convergence_rate: f64::NAN,
            efficiency: f64::NAN,
            standard_error: f64::NAN,
            samples_drawn: 0,
        });
    };

    let n = portfolio.num_assets();
    let weights = DVector::from_column_slice(&portfolio.weights);
    // Portfolio return r = wᵀ(Lz) = (Lᵀw)ᵀz, so one dot product per sample.
    let projected = factor.transpose() * &weights;

    let mut rng = StdRng::seed_from_u64(seed);
    let window = (MC_SAMPLES / 10).max(1);

    // Welford accumulation so running volatility is available at window
    // boundaries without a second pass.
    let mut count = 0usize;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    let mut checkpoints: Vec<f64> = Vec::with_capacity(MC_SAMPLES / window + 1);

    let mut drawn = 0usize;
    while drawn < MC_SAMPLES {
        if cancel.is_cancelled() {
            debug!(drawn, "classical point cancelled mid-batch");
            return None;
        }
        let batch = MC_BATCH_SIZE.min(MC_SAMPLES - drawn);
        for _ in 0..batch {
            let mut r = 0.0;
            for i in 0..n {
                let z: f64 = StandardNormal.sample(&mut rng);
                r += projected[i] * z;
            }
            count += 1;
            let delta = r - mean;
            mean += delta / count as f64;
            m2 += delta * (r - mean);

            if count % window == 0 {
                checkpoints.push(running_std(m2, count));
            }
        }
        drawn += batch;
    }

    let sigma_daily = running_std(m2, count);
    let convergence_rate = convergence_fraction(&checkpoints, sigma_daily);
    let efficiency = variance_efficiency(portfolio, sigma_daily);
    let standard_error = sigma_daily / (MC_SAMPLES as f64).sqrt();

    Some(ClassicalPoint {
        sigma_daily,
        non_psd: false,
        convergence_rate,
        efficiency,
        standard_error,
        samples_drawn: drawn,
    })
}

/// Lower-triangular factor L with Σ = L·Lᵀ. Uses Cholesky when the matrix
/// is positive definite; falls back to an eigendecomposition factor at the
/// semi-definite edge. `None` means the matrix is not PSD at all.
fn correlation_factor(sigma: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(chol) = sigma.clone().cholesky() {
        return Some(chol.l());
    }
    if !kernel::is_psd(sigma) {
        return None;
    }
    let eigen = sigma.clone().symmetric_eigen();
    let scaled = DMatrix::from_fn(sigma.nrows(), sigma.ncols(), |i, j| {
        eigen.eigenvectors[(i, j)] * eigen.eigenvalues[j].max(0.0).sqrt()
    });
    Some(scaled)
}

fn running_std(m2: f64, count: usize) -> f64 {
    if count < 2 {
        return f64::NAN;
    }
    (m2 / (count as f64 - 1.0)).sqrt()
}

/// Fraction of running-volatility checkpoints within `MC_CONVERGENCE_TOL`
/// of the final estimate.
fn convergence_fraction(checkpoints: &[f64], final_sigma: f64) -> f64 {
    if checkpoints.is_empty() || !final_sigma.is_finite() {
        return f64::NAN;
    }
    if final_sigma == 0.0 {
        // Degenerate zero-volatility portfolio: every checkpoint matches.
        return 1.0;
    }
    let within = checkpoints
        .iter()
        .filter(|s| ((*s - final_sigma) / final_sigma).abs() < MC_CONVERGENCE_TOL)
        .count();
    within as f64 / checkpoints.len() as f64
}

/// Variance-reduction ratio against the naive uncorrelated-sum baseline
/// Σᵢ wᵢ²σᵢ², clamped to [0, 1].
fn variance_efficiency(portfolio: &Portfolio, sigma_daily: f64) -> f64 {
    if !sigma_daily.is_finite() {
        return f64::NAN;
    }
    let uncorrelated: f64 = portfolio
        .weights
        .iter()
        .zip(portfolio.volatility.iter())
        .map(|(w, s)| w * w * s * s)
        .sum();
    let empirical = sigma_daily * sigma_daily;
    if empirical <= 0.0 {
        return 1.0;
    }
    (uncorrelated / empirical).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn single_asset(sigma: f64) -> Portfolio {
        Portfolio {
            assets: vec!["A".into()],
            weights: vec![1.0],
            volatility: vec![sigma],
            correlation_matrix: vec![vec![1.0]],
        }
    }

    fn two_asset(rho: f64) -> Portfolio {
        Portfolio {
            assets: vec!["A".into(), "B".into()],
            weights: vec![0.5, 0.5],
            volatility: vec![0.1, 0.3],
            correlation_matrix: vec![vec![1.0, rho], vec![rho, 1.0]],
        }
    }

    #[test]
    fn single_asset_recovers_its_sigma_within_three_percent() {
        let point = simulate_volatility(&single_asset(0.2), 0, &CancelToken::new()).unwrap();
        assert!(!point.non_psd);
        assert_relative_eq!(point.sigma_daily, 0.2, max_relative = 0.03);
        assert_eq!(point.samples_drawn, MC_SAMPLES);
    }

    #[test]
    fn uncorrelated_pair_matches_closed_form_within_two_percent() {
        let expected = (0.25 * 0.01 + 0.25 * 0.09f64).sqrt();
        let point = simulate_volatility(&two_asset(0.0), 0, &CancelToken::new()).unwrap();
        assert_relative_eq!(point.sigma_daily, expected, max_relative = 0.02);
    }

    #[test]
    fn fixed_seed_is_bitwise_reproducible() {
        let a = simulate_volatility(&two_asset(0.3), 42, &CancelToken::new()).unwrap();
        let b = simulate_volatility(&two_asset(0.3), 42, &CancelToken::new()).unwrap();
        assert_eq!(a.sigma_daily.to_bits(), b.sigma_daily.to_bits());
        assert_eq!(a.convergence_rate.to_bits(), b.convergence_rate.to_bits());
    }

    #[test]
    fn different_seeds_differ() {
        let a = simulate_volatility(&two_asset(0.3), 1, &CancelToken::new()).unwrap();
        let b = simulate_volatility(&two_asset(0.3), 2, &CancelToken::new()).unwrap();
        assert_ne!(a.sigma_daily.to_bits(), b.sigma_daily.to_bits());
    }

    #[test]
    fn cancelled_token_aborts_the_point() {
        let token = CancelToken::new();
        token.cancel();
        assert!(simulate_volatility(&two_asset(0.0), 0, &token).is_none());
    }

    #[test]
    fn non_psd_covariance_yields_flagged_nan() {
        let p = Portfolio {
            assets: vec!["A".into(), "B".into(), "C".into()],
            weights: vec![1.0 / 3.0; 3],
            volatility: vec![0.2; 3],
            correlation_matrix: vec![
                vec![1.0, -0.9, -0.9],
                vec![-0.9, 1.0, -0.9],
                vec![-0.9, -0.9, 1.0],
            ],
        };
        let point = simulate_volatility(&p, 0, &CancelToken::new()).unwrap();
        assert!(point.non_psd);
        assert!(point.sigma_daily.is_nan());
        assert_eq!(point.samples_drawn, 0);
    }

    #[test]
    fn positive_correlation_lowers_efficiency_below_one() {
        let point = simulate_volatility(&two_asset(0.8), 0, &CancelToken::new()).unwrap();
        assert!(point.efficiency < 1.0);
        assert!(point.efficiency > 0.0);
    }

    #[test]
    fn negative_correlation_clamps_efficiency_at_one() {
        let point = simulate_volatility(&two_asset(-0.8), 0, &CancelToken::new()).unwrap();
        assert_eq!(point.efficiency, 1.0);
    }

    #[test]
    fn convergence_rate_is_high_for_a_stable_estimate() {
        let point = simulate_volatility(&single_asset(0.2), 0, &CancelToken::new()).unwrap();
        assert!(point.convergence_rate >= 0.8, "got {}", point.convergence_rate);
    }

    #[test]
    fn perfectly_hedged_pair_has_near_zero_volatility() {
        let p = Portfolio {
            assets: vec!["A".into(), "B".into()],
            weights: vec![0.5, 0.5],
            volatility: vec![0.2, 0.2],
            correlation_matrix: vec![vec![1.0, -1.0], vec![-1.0, 1.0]],
        };
        // Cholesky fails on the singular matrix; the eigen factor handles it.
        let point = simulate_volatility(&p, 0, &CancelToken::new()).unwrap();
        assert!(!point.non_psd);
        assert!(point.sigma_daily < 1e-10, "got {}", point.sigma_daily);
    }
}
