//! Pluggable regression over anchor residuals. The Gaussian process with an
//! RBF kernel is the primary realization; piecewise-linear interpolation is
//! the fallback when the Gram matrix stays singular through jitter
//! escalation.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use tracing::debug;

use crate::config::{GP_JITTER_INITIAL, GP_JITTER_MAX};

/// Fit failure that callers are expected to recover from by switching
/// realizations.
#[derive(Clone, Debug)]
pub struct FitError {
    pub reason: String,
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "regression fit failed: {}", self.reason)
    }
}

impl std::error::Error for FitError {}

/// The capability set the hybrid estimator consumes.
pub trait Regressor {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> Result<(), FitError>;
    fn predict(&self, xs: &[f64]) -> Vec<f64>;
    /// Leave-one-out mean squared error on the training set; NaN when the
    /// realization has no meaningful notion of it.
    fn loo_mse(&self) -> f64;
    /// (length_scale, variance); NaN pair for non-kernel realizations.
    fn hyperparams(&self) -> (f64, f64);
}

// ──────────────────────────────────────────────────────────────────────────────
// Gaussian process with RBF kernel
// ──────────────────────────────────────────────────────────────────────────────

pub struct GpRegressor {
    length_scale: f64,
    variance: f64,
    jitter: f64,
    train_x: Vec<f64>,
    train_y: Vec<f64>,
    alpha: DVector<f64>,
}

impl GpRegressor {
    pub fn new() -> Self {
        Self {
            length_scale: f64::NAN,
            variance: f64::NAN,
            jitter: GP_JITTER_INITIAL,
            train_x: Vec::new(),
            train_y: Vec::new(),
            alpha: DVector::zeros(0),
        }
    }

    fn kernel(&self, a: f64, b: f64) -> f64 {
        rbf(a, b, self.length_scale, self.variance)
    }
}

impl Default for GpRegressor {
    fn default() -> Self {
        Self::new()
    }
}

fn rbf(a: f64, b: f64, length_scale: f64, variance: f64) -> f64 {
    let d = (a - b) / length_scale;
    variance * (-0.5 * d * d).exp()
}

fn gram(x: &[f64], length_scale: f64, variance: f64, jitter: f64) -> DMatrix<f64> {
    let n = x.len();
    DMatrix::from_fn(n, n, |i, j| {
        let mut k = rbf(x[i], x[j], length_scale, variance);
        if i == j {
            k += jitter;
        }
        k
    })
}

/// Cholesky with tenfold jitter escalation. Returns the factor and the
/// jitter that succeeded.
fn escalated_cholesky(
    x: &[f64],
    length_scale: f64,
    variance: f64,
) -> Option<(Cholesky<f64, Dyn>, f64)> {
    let mut jitter = GP_JITTER_INITIAL;
    while jitter <= GP_JITTER_MAX {
        let k = gram(x, length_scale, variance, jitter);
        if let Some(chol) = k.cholesky() {
            return Some((chol, jitter));
        }
        jitter *= 10.0;
    }
    None
}

/// Log marginal likelihood of y under the factored Gram matrix.
fn log_marginal_likelihood(chol: &Cholesky<f64, Dyn>, y: &DVector<f64>) -> f64 {
    let alpha = chol.solve(y);
    let data_fit = -0.5 * y.dot(&alpha);
    let log_det: f64 = chol.l().diagonal().iter().map(|d| d.ln()).sum();
    let n = y.len() as f64;
    data_fit - log_det - 0.5 * n * (2.0 * std::f64::consts::PI).ln()
}

impl Regressor for GpRegressor {
    /// Hyperparameters are chosen by marginal-likelihood grid search; ties
    /// resolve to the earliest candidate in scan order.
    fn fit(&mut self, x: &[f64], y: &[f64]) -> Result<(), FitError> {
        if x.len() != y.len() || x.is_empty() {
            return Err(FitError {
                reason: format!("training set sizes {} and {} unusable", x.len(), y.len()),
            });
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(FitError {
                reason: "training data contains non-finite values".into(),
            });
        }

        let span = {
            let min = x.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let s = max - min;
            if s > 0.0 {
                s
            } else {
                1.0
            }
        };
        let y_vec = DVector::from_column_slice(y);
        let n = y.len() as f64;
        let y_var = y.iter().map(|v| v * v).sum::<f64>() / n;
        let base_var = y_var.max(1e-12);

        const LS_FACTORS: [f64; 8] = [0.1, 0.2, 0.35, 0.5, 0.75, 1.0, 1.5, 2.0];
        const VAR_FACTORS: [f64; 5] = [0.1, 0.5, 1.0, 2.0, 10.0];

        let mut best: Option<(f64, f64, f64, Cholesky<f64, Dyn>, f64)> = None;
        for lf in LS_FACTORS {
            for vf in VAR_FACTORS {
                let ls = lf * span;
                let var = vf * base_var;
                let Some((chol, jitter)) = escalated_cholesky(x, ls, var) else {
                    continue;
                };
                let lml = log_marginal_likelihood(&chol, &y_vec);
                if !lml.is_finite() {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_lml, ..)) => lml > *best_lml,
                };
                if better {
                    best = Some((lml, ls, var, chol, jitter));
                }
            }
        }

        let Some((lml, ls, var, chol, jitter)) = best else {
            return Err(FitError {
                reason: "Gram matrix singular for every hyperparameter candidate".into(),
            });
        };
        debug!(length_scale = ls, variance = var, lml, "gp hyperparameters selected");

        self.length_scale = ls;
        self.variance = var;
        self.jitter = jitter;
        self.train_x = x.to_vec();
        self.train_y = y.to_vec();
        self.alpha = chol.solve(&y_vec);
        Ok(())
    }

    fn predict(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter()
            .map(|&xq| {
                self.train_x
                    .iter()
                    .enumerate()
                    .map(|(i, &xt)| self.kernel(xq, xt) * self.alpha[i])
                    .sum()
            })
            .collect()
    }

    /// Leave-one-out MSE with the already-selected hyperparameters.
    fn loo_mse(&self) -> f64 {
        let n = self.train_x.len();
        if n < 2 {
            return f64::NAN;
        }
        let mut sum_sq = 0.0;
        for holdout in 0..n {
            let x_rest: Vec<f64> = self
                .train_x
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != holdout)
                .map(|(_, v)| *v)
                .collect();
            let y_rest: Vec<f64> = self
                .train_y
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != holdout)
                .map(|(_, v)| *v)
                .collect();

            let Some((chol, _)) = escalated_cholesky(&x_rest, self.length_scale, self.variance)
            else {
                return f64::NAN;
            };
            let alpha = chol.solve(&DVector::from_column_slice(&y_rest));
            let pred: f64 = x_rest
                .iter()
                .enumerate()
                .map(|(i, &xt)| rbf(self.train_x[holdout], xt, self.length_scale, self.variance) * alpha[i])
                .sum();
            let err = pred - self.train_y[holdout];
            sum_sq += err * err;
        }
        sum_sq / n as f64
    }

    fn hyperparams(&self) -> (f64, f64) {
        (self.length_scale, self.variance)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Piecewise-linear fallback
// ──────────────────────────────────────────────────────────────────────────────

pub struct PiecewiseLinear {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl PiecewiseLinear {
    pub fn new() -> Self {
        Self {
            x: Vec::new(),
            y: Vec::new(),
        }
    }
}

impl Default for PiecewiseLinear {
    fn default() -> Self {
        Self::new()
    }
}

impl Regressor for PiecewiseLinear {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> Result<(), FitError> {
        if x.len() != y.len() || x.is_empty() {
            return Err(FitError {
                reason: "empty or mismatched training set".into(),
            });
        }
        let mut pairs: Vec<(f64, f64)> = x.iter().cloned().zip(y.iter().cloned()).collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        self.x = pairs.iter().map(|p| p.0).collect();
        self.y = pairs.iter().map(|p| p.1).collect();
        Ok(())
    }

    fn predict(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&xq| interpolate(&self.x, &self.y, xq)).collect()
    }

    fn loo_mse(&self) -> f64 {
        f64::NAN
    }

    fn hyperparams(&self) -> (f64, f64) {
        (f64::NAN, f64::NAN)
    }
}

/// Linear interpolation with flat extension beyond the knot range.
fn interpolate(x: &[f64], y: &[f64], xq: f64) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    if xq <= x[0] {
        return y[0];
    }
    if xq >= x[x.len() - 1] {
        return y[y.len() - 1];
    }
    let hi = x.partition_point(|&v| v < xq);
    let lo = hi - 1;
    let t = (xq - x[lo]) / (x[hi] - x[lo]);
    y[lo] + t * (y[hi] - y[lo])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn gp_interpolates_training_points_closely() {
        let x = [0.0, 0.5, 1.0];
        let y = [0.001, -0.002, 0.0015];
        let mut gp = GpRegressor::new();
        gp.fit(&x, &y).unwrap();
        let pred = gp.predict(&x);
        for (p, t) in pred.iter().zip(y.iter()) {
            assert_abs_diff_eq!(p, t, epsilon = 1e-4);
        }
    }

    #[test]
    fn gp_prediction_is_smooth_between_anchors() {
        let x = [0.0, 0.5, 1.0];
        let y = [0.0, 0.01, 0.0];
        let mut gp = GpRegressor::new();
        gp.fit(&x, &y).unwrap();
        let mid = gp.predict(&[0.25])[0];
        assert!(mid > 0.0 && mid < 0.01, "expected between endpoints, got {mid}");
    }

    #[test]
    fn gp_fit_is_deterministic() {
        let x = [0.0, 0.3, 0.7, 1.0];
        let y = [0.002, -0.001, 0.0005, 0.003];
        let mut a = GpRegressor::new();
        let mut b = GpRegressor::new();
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.hyperparams(), b.hyperparams());
        let pa = a.predict(&[0.41]);
        let pb = b.predict(&[0.41]);
        assert_eq!(pa[0].to_bits(), pb[0].to_bits());
    }

    #[test]
    fn gp_loo_mse_is_small_for_smooth_data() {
        let x: Vec<f64> = (0..5).map(|i| i as f64 / 4.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 0.01 * (v * 2.0).sin()).collect();
        let mut gp = GpRegressor::new();
        gp.fit(&x, &y).unwrap();
        let mse = gp.loo_mse();
        assert!(mse.is_finite());
        assert!(mse < 1e-4, "got {mse}");
    }

    #[test]
    fn gp_rejects_non_finite_training_data() {
        let mut gp = GpRegressor::new();
        assert!(gp.fit(&[0.0, 1.0], &[0.1, f64::NAN]).is_err());
    }

    #[test]
    fn linear_fallback_interpolates_exactly() {
        let mut lin = PiecewiseLinear::new();
        lin.fit(&[0.0, 1.0, 2.0], &[0.0, 2.0, 0.0]).unwrap();
        let pred = lin.predict(&[0.5, 1.5, -1.0, 3.0]);
        assert_relative_eq!(pred[0], 1.0, max_relative = 1e-12);
        assert_relative_eq!(pred[1], 1.0, max_relative = 1e-12);
        assert_eq!(pred[2], 0.0);
        assert_eq!(pred[3], 0.0);
    }

    #[test]
    fn linear_fallback_has_nan_diagnostics() {
        let mut lin = PiecewiseLinear::new();
        lin.fit(&[0.0, 1.0], &[0.0, 1.0]).unwrap();
        assert!(lin.loo_mse().is_nan());
        let (ls, var) = lin.hyperparams();
        assert!(ls.is_nan() && var.is_nan());
    }
}
