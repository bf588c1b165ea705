//! Hybrid estimator: a classical baseline curve across the full sweep,
//! sparse quantum evaluations at anchor points, and a GP-interpolated
//! residual correction with fit diagnostics.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::RunContext;
use crate::classical::{self, ClassicalPoint};
use crate::config::CORRECTION_SIGNIFICANCE;
use crate::gp::{GpRegressor, PiecewiseLinear, Regressor};
use crate::quantum::{self, QuantumConfig, QuantumPoint};
use crate::result::nan_null;
use crate::sweep::SweepPlan;

/// Mode-specific analytics for a hybrid run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HybridMetrics {
    #[serde(with = "nan_null")]
    pub mean_quantum_correction: f64,
    #[serde(with = "nan_null")]
    pub max_quantum_correction: f64,
    #[serde(with = "nan_null")]
    pub fraction_significant_correction: f64,
    /// RMS distance between the corrected curve and the quantum estimates at
    /// the anchors; nonzero values indicate regularization pull.
    #[serde(with = "nan_null")]
    pub hybrid_baseline_vs_quantum: f64,
    #[serde(with = "nan_null")]
    pub gp_interpolation_mse: f64,
    #[serde(with = "nan_null")]
    pub gp_kernel_length_scale: f64,
    #[serde(with = "nan_null")]
    pub gp_kernel_variance: f64,
    #[serde(with = "nan_null")]
    pub curve_shape_change: f64,
    pub num_anchors: usize,
    pub anchor_values: Vec<f64>,
}

impl HybridMetrics {
    fn unavailable(anchor_values: Vec<f64>) -> Self {
        Self {
            mean_quantum_correction: f64::NAN,
            max_quantum_correction: f64::NAN,
            fraction_significant_correction: f64::NAN,
            hybrid_baseline_vs_quantum: f64::NAN,
            gp_interpolation_mse: f64::NAN,
            gp_kernel_length_scale: f64::NAN,
            gp_kernel_variance: f64::NAN,
            curve_shape_change: f64::NAN,
            num_anchors: anchor_values.len(),
            anchor_values,
        }
    }
}

/// Everything the engine needs from a hybrid sweep.
#[derive(Debug)]
pub struct HybridOutcome {
    /// Corrected daily volatility per completed step.
    pub sigma: Vec<f64>,
    /// The classical points backing the curve (same length as `sigma`).
    pub classical_points: Vec<ClassicalPoint>,
    /// Anchor step indices actually evaluated.
    pub anchors: Vec<usize>,
    pub quantum_points: Vec<QuantumPoint>,
    pub metrics: HybridMetrics,
    pub gp_fallback: bool,
    pub cancelled: bool,
}

/// Evenly spaced anchor indices including both endpoints.
pub fn anchor_indices(steps: usize, requested: usize) -> Vec<usize> {
    let count = requested.min(steps).max(2.min(steps));
    if count <= 1 || steps == 1 {
        return vec![0];
    }
    let mut indices: Vec<usize> = (0..count)
        .map(|i| ((i * (steps - 1)) as f64 / (count - 1) as f64).round() as usize)
        .collect();
    indices.dedup();
    indices
}

/// Runs the full hybrid pipeline. Cancellation mid-classical-sweep returns
/// the completed classical prefix uncorrected; cancellation during the
/// anchor phase returns the full classical curve uncorrected. Both set the
/// cancelled flag.
pub fn run_sweep(
    plan: &SweepPlan,
    quantum_cfg: &QuantumConfig,
    num_anchors: usize,
    seed: u64,
    ctx: &RunContext,
    on_step: &mut dyn FnMut(usize),
) -> HybridOutcome {
    let steps = plan.len();

    // Phase 1: classical baseline across the whole sweep.
    let mut classical_points: Vec<ClassicalPoint> = Vec::with_capacity(steps);
    for i in 0..steps {
        if ctx.poll() {
            break;
        }
        let variant = plan.variant(i);
        match classical::simulate_volatility(&variant, seed.wrapping_add(i as u64), ctx.token()) {
            Some(point) => {
                classical_points.push(point);
                on_step(i + 1);
            }
            None => break,
        }
    }

    let sigma_cls: Vec<f64> = classical_points.iter().map(|p| p.sigma_daily).collect();

    if classical_points.len() < steps {
        info!(
            completed = classical_points.len(),
            steps, "hybrid run cancelled during classical phase"
        );
        return HybridOutcome {
            sigma: sigma_cls,
            classical_points,
            anchors: Vec::new(),
            quantum_points: Vec::new(),
            metrics: HybridMetrics::unavailable(Vec::new()),
            gp_fallback: false,
            cancelled: true,
        };
    }

    // Phase 2: quantum calibration at the anchors.
    let anchors = anchor_indices(steps, num_anchors);
    let anchor_values: Vec<f64> = anchors.iter().map(|&i| plan.values()[i]).collect();

    let mut quantum_points: Vec<QuantumPoint> = Vec::with_capacity(anchors.len());
    for &i in &anchors {
        if ctx.poll() {
            break;
        }
        let variant = plan.variant(i);
        match quantum::estimate_point(&variant, quantum_cfg, seed.wrapping_add(i as u64), ctx.token())
        {
            Some(point) => quantum_points.push(point),
            None => break,
        }
    }

    if quantum_points.len() < anchors.len() {
        info!("hybrid run cancelled during anchor phase; returning uncorrected curve");
        return HybridOutcome {
            sigma: sigma_cls,
            classical_points,
            anchors,
            quantum_points,
            metrics: HybridMetrics::unavailable(anchor_values),
            gp_fallback: false,
            cancelled: true,
        };
    }

    // Phase 3: residual regression and correction.
    let mut calib_x = Vec::new();
    let mut calib_y = Vec::new();
    for (slot, &i) in anchors.iter().enumerate() {
        let q = quantum_points[slot].sigma_daily;
        let c = sigma_cls[i];
        if q.is_finite() && c.is_finite() {
            calib_x.push(plan.values()[i]);
            calib_y.push(q - c);
        }
    }

    if calib_x.len() < 2 {
        warn!(
            usable = calib_x.len(),
            "too few usable anchors for residual regression; curve left uncorrected"
        );
        return HybridOutcome {
            sigma: sigma_cls,
            classical_points,
            anchors,
            quantum_points,
            metrics: HybridMetrics::unavailable(anchor_values),
            gp_fallback: true,
            cancelled: false,
        };
    }

    let mut gp = GpRegressor::new();
    let (regressor, gp_fallback): (Box<dyn Regressor>, bool) = match gp.fit(&calib_x, &calib_y) {
        Ok(()) => (Box::new(gp), false),
        Err(err) => {
            warn!(%err, "gp fit failed; falling back to piecewise-linear interpolation");
            let mut lin = PiecewiseLinear::new();
            // Fitting sorted finite pairs cannot fail.
            lin.fit(&calib_x, &calib_y).expect("piecewise-linear fit on finite anchors");
            (Box::new(lin), true)
        }
    };

    let correction = regressor.predict(plan.values());
    let sigma: Vec<f64> = sigma_cls
        .iter()
        .zip(correction.iter())
        .map(|(c, d)| if c.is_finite() { c + d } else { *c })
        .collect();

    let metrics = diagnostics(
        &calib_y,
        &anchors,
        &anchor_values,
        &quantum_points,
        &sigma,
        &sigma_cls,
        regressor.as_ref(),
    );
    debug!(
        mean_correction = metrics.mean_quantum_correction,
        max_correction = metrics.max_quantum_correction,
        "hybrid correction applied"
    );

    HybridOutcome {
        sigma,
        classical_points,
        anchors,
        quantum_points,
        metrics,
        gp_fallback,
        cancelled: false,
    }
}

fn diagnostics(
    residuals: &[f64],
    anchors: &[usize],
    anchor_values: &[f64],
    quantum_points: &[QuantumPoint],
    sigma_hyb: &[f64],
    sigma_cls: &[f64],
    regressor: &dyn Regressor,
) -> HybridMetrics {
    let n = residuals.len() as f64;
    let mean_correction = residuals.iter().map(|d| d.abs()).sum::<f64>() / n;
    let max_correction = residuals.iter().map(|d| d.abs()).fold(0.0, f64::max);
    let significant = residuals
        .iter()
        .filter(|d| d.abs() > CORRECTION_SIGNIFICANCE)
        .count() as f64
        / n;

    // RMS between the corrected curve and the quantum estimates at anchors.
    let mut rms_sum = 0.0;
    let mut rms_count = 0usize;
    for (slot, &i) in anchors.iter().enumerate() {
        let q = quantum_points[slot].sigma_daily;
        if q.is_finite() && sigma_hyb[i].is_finite() {
            let diff = sigma_hyb[i] - q;
            rms_sum += diff * diff;
            rms_count += 1;
        }
    }
    let baseline_vs_quantum = if rms_count > 0 {
        (rms_sum / rms_count as f64).sqrt()
    } else {
        f64::NAN
    };

    let (length_scale, variance) = regressor.hyperparams();
    let shape_change =
        (count_extrema(sigma_hyb) as f64 - count_extrema(sigma_cls) as f64).abs();

    HybridMetrics {
        mean_quantum_correction: mean_correction,
        max_quantum_correction: max_correction,
        fraction_significant_correction: significant,
        hybrid_baseline_vs_quantum: baseline_vs_quantum,
        gp_interpolation_mse: regressor.loo_mse(),
        gp_kernel_length_scale: length_scale,
        gp_kernel_variance: variance,
        curve_shape_change: shape_change,
        num_anchors: anchors.len(),
        anchor_values: anchor_values.to_vec(),
    }
}

/// Number of strict interior extrema of a curve, skipping non-finite points.
pub fn count_extrema(values: &[f64]) -> usize {
    let finite: Vec<f64> = values.iter().cloned().filter(|v| v.is_finite()).collect();
    if finite.len() < 3 {
        return 0;
    }
    let mut count = 0;
    for w in finite.windows(3) {
        let left = w[1] - w[0];
        let right = w[2] - w[1];
        if left * right < 0.0 {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PerturbParam, PerturbSpec, Portfolio};

    fn plan(steps: usize) -> SweepPlan {
        let portfolio = Portfolio {
            assets: vec!["A".into(), "B".into()],
            weights: vec![0.5, 0.5],
            volatility: vec![0.15, 0.15],
            correlation_matrix: vec![vec![1.0, 0.3], vec![0.3, 1.0]],
        };
        let spec = PerturbSpec {
            param: PerturbParam::Volatility,
            asset: "A".into(),
            asset_index: 0,
            range: (0.1, 0.2),
            steps,
        };
        SweepPlan::new(portfolio, spec)
    }

    #[test]
    fn anchor_indices_include_both_endpoints() {
        assert_eq!(anchor_indices(7, 3), vec![0, 3, 6]);
        assert_eq!(anchor_indices(5, 3), vec![0, 2, 4]);
        assert_eq!(anchor_indices(2, 3), vec![0, 1]);
        assert_eq!(anchor_indices(10, 4), vec![0, 3, 6, 9]);
    }

    #[test]
    fn extrema_counting_ignores_monotone_curves() {
        assert_eq!(count_extrema(&[1.0, 2.0, 3.0, 4.0]), 0);
        assert_eq!(count_extrema(&[1.0, 3.0, 2.0, 4.0]), 2);
        assert_eq!(count_extrema(&[1.0, f64::NAN, 3.0, 2.0, 4.0]), 2);
    }

    #[test]
    fn corrected_curve_stays_near_classical() {
        let plan = plan(7);
        let ctx = RunContext::unbounded();
        let outcome = run_sweep(&plan, &QuantumConfig::from_options(None), 3, 0, &ctx, &mut |_| {});

        assert!(!outcome.cancelled);
        assert_eq!(outcome.sigma.len(), 7);
        assert_eq!(outcome.anchors, vec![0, 3, 6]);

        let max_corr = outcome.metrics.max_quantum_correction;
        assert!(max_corr.is_finite());
        for (i, (hyb, cls)) in outcome
            .sigma
            .iter()
            .zip(outcome.classical_points.iter().map(|p| p.sigma_daily))
            .enumerate()
        {
            if outcome.anchors.contains(&i) {
                continue;
            }
            // The RBF interpolant may overshoot the anchor residuals a
            // little; a 25% margin covers that without hiding regressions.
            let dist = (hyb - cls).abs();
            assert!(
                dist <= 1.25 * max_corr + 1e-6,
                "step {i}: correction {dist} exceeds max anchor correction {max_corr}"
            );
        }
    }

    #[test]
    fn gp_diagnostics_are_populated() {
        let plan = plan(7);
        let ctx = RunContext::unbounded();
        let outcome = run_sweep(&plan, &QuantumConfig::from_options(None), 3, 0, &ctx, &mut |_| {});

        let m = &outcome.metrics;
        assert!(!outcome.gp_fallback);
        assert!(m.gp_interpolation_mse.is_finite());
        assert!(m.gp_interpolation_mse < 1e-4, "got {}", m.gp_interpolation_mse);
        assert!(m.gp_kernel_length_scale.is_finite());
        assert!(m.gp_kernel_variance.is_finite());
        assert!(m.curve_shape_change <= 1.0);
        assert_eq!(m.num_anchors, 3);
        assert_eq!(m.anchor_values.len(), 3);
    }

    #[test]
    fn corrected_curve_tracks_quantum_at_anchors() {
        let plan = plan(5);
        let ctx = RunContext::unbounded();
        let outcome = run_sweep(&plan, &QuantumConfig::from_options(None), 3, 1, &ctx, &mut |_| {});

        let tolerance = outcome.metrics.hybrid_baseline_vs_quantum;
        for (slot, &i) in outcome.anchors.iter().enumerate() {
            let q = outcome.quantum_points[slot].sigma_daily;
            let dist = (outcome.sigma[i] - q).abs();
            // Each anchor distance is bounded by a small multiple of the RMS.
            assert!(
                dist <= tolerance * outcome.anchors.len() as f64 + 1e-9,
                "anchor {i}: {dist} vs rms {tolerance}"
            );
        }
    }

    #[test]
    fn pre_cancelled_context_returns_empty_prefix() {
        let plan = plan(5);
        let ctx = RunContext::unbounded();
        ctx.token().cancel();
        let outcome = run_sweep(&plan, &QuantumConfig::from_options(None), 3, 0, &ctx, &mut |_| {});
        assert!(outcome.cancelled);
        assert!(outcome.sigma.is_empty());
        assert!(outcome.metrics.gp_interpolation_mse.is_nan());
    }
}
