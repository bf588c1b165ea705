//! Portfolio-metric kernel: covariance assembly and the closed-form daily
//! volatility shared by every estimator.

use nalgebra::DMatrix;

use crate::config::{PSD_EIGEN_TOL, TRADING_DAYS};
use crate::model::Portfolio;

/// Kernel output for one portfolio variant. A non-PSD covariance yields a
/// NaN volatility with the flag set; the caller decides whether that is an
/// error or a reportable step condition.
#[derive(Clone, Copy, Debug)]
pub struct KernelOutput {
    pub sigma_daily: f64,
    pub non_psd: bool,
}

/// Assembles Σ = diag(σ) · R · diag(σ) from per-asset daily volatilities and
/// the correlation matrix.
pub fn covariance_matrix(portfolio: &Portfolio) -> DMatrix<f64> {
    let n = portfolio.num_assets();
    DMatrix::from_fn(n, n, |i, j| {
        portfolio.volatility[i] * portfolio.volatility[j] * portfolio.correlation_matrix[i][j]
    })
}

/// Positive semi-definiteness check via symmetric eigendecomposition.
/// Eigenvalues above `PSD_EIGEN_TOL` count as non-negative.
pub fn is_psd(matrix: &DMatrix<f64>) -> bool {
    if matrix.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let eigen = matrix.clone().symmetric_eigen();
    eigen.eigenvalues.iter().all(|&ev| ev >= PSD_EIGEN_TOL)
}

/// Closed-form daily portfolio volatility σ_p = √(wᵀ Σ w).
pub fn portfolio_volatility(portfolio: &Portfolio) -> KernelOutput {
    let sigma = covariance_matrix(portfolio);
    if !is_psd(&sigma) {
        return KernelOutput {
            sigma_daily: f64::NAN,
            non_psd: true,
        };
    }

    let n = portfolio.num_assets();
    let mut quad = 0.0;
    for i in 0..n {
        for j in 0..n {
            quad += portfolio.weights[i] * portfolio.weights[j] * sigma[(i, j)];
        }
    }

    // The eigenvalue tolerance admits tiny negative quadratic forms at the
    // floating edge; clamp those to zero rather than returning NaN.
    if quad < 0.0 {
        if quad < PSD_EIGEN_TOL {
            return KernelOutput {
                sigma_daily: f64::NAN,
                non_psd: true,
            };
        }
        quad = 0.0;
    }

    KernelOutput {
        sigma_daily: quad.sqrt(),
        non_psd: false,
    }
}

/// Annualized volatility from a daily figure.
pub fn annualize(sigma_daily: f64) -> f64 {
    sigma_daily * TRADING_DAYS.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn portfolio(weights: Vec<f64>, vols: Vec<f64>, corr: Vec<Vec<f64>>) -> Portfolio {
        let assets = (0..weights.len()).map(|i| format!("A{i}")).collect();
        Portfolio {
            assets,
            weights,
            volatility: vols,
            correlation_matrix: corr,
        }
    }

    #[test]
    fn single_asset_volatility_is_its_own_sigma() {
        let p = portfolio(vec![1.0], vec![0.2], vec![vec![1.0]]);
        let out = portfolio_volatility(&p);
        assert!(!out.non_psd);
        assert_relative_eq!(out.sigma_daily, 0.2, max_relative = 1e-12);
    }

    #[test]
    fn uncorrelated_two_asset_closed_form() {
        let p = portfolio(
            vec![0.5, 0.5],
            vec![0.1, 0.3],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        );
        let expected = (0.25 * 0.01 + 0.25 * 0.09f64).sqrt();
        let out = portfolio_volatility(&p);
        assert_relative_eq!(out.sigma_daily, expected, max_relative = 1e-12);
    }

    #[test]
    fn perfectly_negatively_correlated_pair_can_cancel() {
        let p = portfolio(
            vec![0.5, 0.5],
            vec![0.2, 0.2],
            vec![vec![1.0, -1.0], vec![-1.0, 1.0]],
        );
        let out = portfolio_volatility(&p);
        assert!(!out.non_psd);
        assert_relative_eq!(out.sigma_daily, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn non_psd_correlation_flags_nan() {
        // Three assets pairwise correlated at -0.9 cannot coexist.
        let p = portfolio(
            vec![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
            vec![0.2, 0.2, 0.2],
            vec![
                vec![1.0, -0.9, -0.9],
                vec![-0.9, 1.0, -0.9],
                vec![-0.9, -0.9, 1.0],
            ],
        );
        let out = portfolio_volatility(&p);
        assert!(out.non_psd);
        assert!(out.sigma_daily.is_nan());
    }

    #[test]
    fn annualization_uses_sqrt_252() {
        assert_relative_eq!(annualize(0.02), 0.02 * 252f64.sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn covariance_diagonal_is_variance() {
        let p = portfolio(
            vec![0.5, 0.5],
            vec![0.1, 0.3],
            vec![vec![1.0, 0.3], vec![0.3, 1.0]],
        );
        let sigma = covariance_matrix(&p);
        assert_relative_eq!(sigma[(0, 0)], 0.01, max_relative = 1e-12);
        assert_relative_eq!(sigma[(1, 1)], 0.09, max_relative = 1e-12);
        assert_relative_eq!(sigma[(0, 1)], 0.1 * 0.3 * 0.3, max_relative = 1e-12);
    }
}
