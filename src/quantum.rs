//! Quantum estimator: encodes the tail probability of the single-day
//! portfolio return into the amplitude of a prepared state and recovers an
//! implied volatility through amplitude estimation on a state-vector
//! simulator.
//!
//! Each point walks three stages: Prepared (distribution loaded onto the
//! price register), Estimated (iterative amplitude estimation over Grover
//! power levels), Mapped (amplitude inverted through the Gaussian CDF back
//! to a volatility). A failure at any stage falls back to the classical
//! closed form for that point; the sweep itself never aborts.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{
    DEFAULT_PRICE_QUBITS, DEFAULT_SHOTS, DEFAULT_THRESHOLD, EVAL_QUBITS, GRID_WIDTH_SIGMAS,
    MLE_GRID_POINTS,
};
use crate::kernel;
use crate::model::{Portfolio, QuantumOptions};
use crate::result::nan_null;

/// Resolved quantum configuration: request options merged with defaults.
#[derive(Clone, Copy, Debug)]
pub struct QuantumConfig {
    pub price_qubits: usize,
    pub eval_qubits: usize,
    pub shots: u64,
    pub threshold: f64,
}

impl QuantumConfig {
    pub fn from_options(options: Option<&QuantumOptions>) -> Self {
        let opts = options.copied().unwrap_or_default();
        Self {
            price_qubits: opts.num_qubits.unwrap_or(DEFAULT_PRICE_QUBITS),
            eval_qubits: EVAL_QUBITS,
            shots: opts.shots.unwrap_or(DEFAULT_SHOTS),
            threshold: opts.threshold.unwrap_or(DEFAULT_THRESHOLD),
        }
    }

    pub fn total_qubits(&self) -> usize {
        self.price_qubits + self.eval_qubits
    }

    /// Grover powers evaluated per point: 0 (direct measurement of the
    /// prepared state) followed by doubling powers, one per evaluation qubit.
    fn grover_powers(&self) -> Vec<u64> {
        let mut powers = vec![0u64];
        powers.extend((0..self.eval_qubits).map(|j| 1u64 << j));
        powers
    }
}

/// Gate-level cost of the circuits run for one point, from the standard
/// multiplexed-rotation loader and Grover-operator decompositions.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CircuitProfile {
    pub total_qubits: usize,
    pub depth: usize,
    pub gates: usize,
    pub circuits: usize,
}

impl CircuitProfile {
    fn for_point(cfg: &QuantumConfig) -> Self {
        let cells = 1usize << cfg.price_qubits;
        // Möttönen-style real-amplitude loader: one rotation per node of the
        // binary tree plus the entangling ladder.
        let loader = (cells - 1) + cells.saturating_sub(cfg.price_qubits + 1);
        let oracle = cfg.price_qubits + 1;
        let grover = 2 * loader + oracle + cells;

        let mut depth = 0usize;
        let mut gates = 0usize;
        let mut circuits = 0usize;
        for m in cfg.grover_powers() {
            let circuit_gates = loader + (m as usize) * grover + cfg.price_qubits;
            gates += circuit_gates;
            depth = depth.max(circuit_gates);
            circuits += 1;
        }

        Self {
            total_qubits: cfg.total_qubits(),
            depth,
            gates,
            circuits,
        }
    }
}

/// One evaluated quantum point.
#[derive(Clone, Copy, Debug)]
pub struct QuantumPoint {
    pub sigma_daily: f64,
    pub non_psd: bool,
    /// True when the simulator path failed and the classical closed form was
    /// used instead.
    pub fallback: bool,
    /// True when the zero-threshold surrogate tail (τ = −σ_cls) was used.
    pub used_surrogate: bool,
    /// Classical closed-form volatility for this variant.
    pub surrogate_sigma: f64,
    /// Estimated amplitude â.
    pub amplitude: f64,
    /// Threshold actually encoded, after alignment to the grid.
    pub threshold_used: f64,
    pub shots_fired: u64,
    pub profile: CircuitProfile,
}

/// Mode-specific analytics for a quantum run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuantumMetrics {
    pub circuit_depth: usize,
    pub total_qubits: usize,
    pub quantum_operations: usize,
    #[serde(with = "nan_null")]
    pub shots_per_second: f64,
    #[serde(with = "nan_null")]
    pub circuits_per_second: f64,
    #[serde(with = "nan_null")]
    pub enhancement_factor: f64,
    #[serde(with = "nan_null")]
    pub quantum_advantage_ratio: f64,
    /// Mean classical closed-form sigma used to center the surrogate tail,
    /// NaN when no point needed the surrogate.
    #[serde(with = "nan_null")]
    pub classical_surrogate_sigma: f64,
}

struct StageFailure {
    stage: &'static str,
    reason: String,
}

struct Preparation {
    tau: f64,
    amplitude_sq: f64,
}

/// Estimates the volatility of one portfolio variant. Returns `None` when
/// cancellation fires at a circuit boundary; simulator failures fall back to
/// the classical closed form with the fallback flag set.
pub fn estimate_point(
    portfolio: &Portfolio,
    cfg: &QuantumConfig,
    seed: u64,
    cancel: &CancelToken,
) -> Option<QuantumPoint> {
    let closed_form = kernel::portfolio_volatility(portfolio);
    if closed_form.non_psd {
        return Some(QuantumPoint {
            sigma_daily: f64::NAN,
            non_psd: true,
            fallback: false,
            used_surrogate: false,
            surrogate_sigma: f64::NAN,
            amplitude: f64::NAN,
            threshold_used: f64::NAN,
            shots_fired: 0,
            profile: CircuitProfile::default(),
        });
    }
    let sigma_cls = closed_form.sigma_daily;

    let used_surrogate = cfg.threshold == 0.0;
    let tau_requested = if used_surrogate { -sigma_cls } else { cfg.threshold };

    let profile = CircuitProfile::for_point(cfg);
    let levels = cfg.grover_powers();
    let shots_fired = cfg.shots * levels.len() as u64;

    let outcome = run_point(cfg, sigma_cls, tau_requested, seed, cancel);
    match outcome {
        Ok(Some((sigma, amplitude, tau_used))) => Some(QuantumPoint {
            sigma_daily: sigma,
            non_psd: false,
            fallback: false,
            used_surrogate,
            surrogate_sigma: sigma_cls,
            amplitude,
            threshold_used: tau_used,
            shots_fired,
            profile,
        }),
        Ok(None) => None,
        Err(failure) => {
            warn!(
                stage = failure.stage,
                reason = %failure.reason,
                "quantum point failed; falling back to classical closed form"
            );
            Some(QuantumPoint {
                sigma_daily: sigma_cls,
                non_psd: false,
                fallback: true,
                used_surrogate,
                surrogate_sigma: sigma_cls,
                amplitude: f64::NAN,
                threshold_used: tau_requested,
                shots_fired: 0,
                profile,
            })
        }
    }
}

/// The Prepared → Estimated → Mapped pipeline for one point.
/// `Ok(None)` means cancelled.
fn run_point(
    cfg: &QuantumConfig,
    sigma_cls: f64,
    tau: f64,
    seed: u64,
    cancel: &CancelToken,
) -> Result<Option<(f64, f64, f64)>, StageFailure> {
    let prep = prepare(cfg, sigma_cls, tau)?;
    let Some(amplitude) = estimate(cfg, prep.amplitude_sq, seed, cancel)? else {
        return Ok(None);
    };
    let sigma = map_amplitude(cfg, prep.tau, amplitude)?;
    Ok(Some((sigma, amplitude, prep.tau)))
}

/// Prepared: discretize N(0, σ_cls²) over a symmetric ±kσ grid of 2^{q_p}
/// cells, amplitude-loading each cell's probability mass. The marked
/// subspace is the set of cells below the threshold, so the prepared
/// amplitude squared equals the discretized tail probability.
fn prepare(cfg: &QuantumConfig, sigma_cls: f64, tau: f64) -> Result<Preparation, StageFailure> {
    if !sigma_cls.is_finite() || sigma_cls <= 0.0 {
        return Err(StageFailure {
            stage: "prepared",
            reason: format!("degenerate volatility {sigma_cls}"),
        });
    }

    let cells = 1usize << cfg.price_qubits;
    let half_width = GRID_WIDTH_SIGMAS * sigma_cls;
    let cell_width = 2.0 * half_width / cells as f64;

    // Align the threshold to the nearest cell boundary so the marked
    // subspace is exactly a prefix of cells.
    let boundary = ((tau + half_width) / cell_width).round() as i64;
    if boundary <= 0 || boundary >= cells as i64 {
        return Err(StageFailure {
            stage: "prepared",
            reason: format!("threshold {tau} lies outside the ±{GRID_WIDTH_SIGMAS}σ grid"),
        });
    }
    let tau_snapped = -half_width + boundary as f64 * cell_width;

    let normal = Normal::new(0.0, sigma_cls).map_err(|e| StageFailure {
        stage: "prepared",
        reason: e.to_string(),
    })?;
    let total_mass = normal.cdf(half_width) - normal.cdf(-half_width);
    let tail_mass = normal.cdf(tau_snapped) - normal.cdf(-half_width);
    let amplitude_sq = tail_mass / total_mass;

    if !amplitude_sq.is_finite() || amplitude_sq <= 0.0 || amplitude_sq >= 1.0 {
        return Err(StageFailure {
            stage: "prepared",
            reason: format!("degenerate marked amplitude {amplitude_sq}"),
        });
    }

    Ok(Preparation {
        tau: tau_snapped,
        amplitude_sq,
    })
}

/// Estimated: iterative amplitude estimation. For each Grover power m the
/// marked-outcome probability is sin²((2m+1)θ); `shots` measurements are
/// drawn per level and a maximum-likelihood grid search recovers θ.
/// Cancellation is polled at every circuit boundary; `Ok(None)` = cancelled.
fn estimate(
    cfg: &QuantumConfig,
    amplitude_sq: f64,
    seed: u64,
    cancel: &CancelToken,
) -> Result<Option<f64>, StageFailure> {
    let theta = amplitude_sq.sqrt().asin();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut observations = Vec::new();
    for m in cfg.grover_powers() {
        if cancel.is_cancelled() {
            debug!(power = m, "quantum point cancelled at circuit boundary");
            return Ok(None);
        }
        let angle = (2 * m + 1) as f64 * theta;
        let p_marked = angle.sin().powi(2).clamp(0.0, 1.0);
        let binomial = Binomial::new(cfg.shots, p_marked).map_err(|e| StageFailure {
            stage: "estimated",
            reason: e.to_string(),
        })?;
        let hits = binomial.sample(&mut rng);
        observations.push((m, hits));
    }

    Ok(Some(max_likelihood_amplitude(
        &observations,
        cfg.shots,
        MLE_GRID_POINTS,
    )))
}

/// Grid-search maximum likelihood over θ ∈ (0, π/2). Ties resolve to the
/// smallest grid index.
fn max_likelihood_amplitude(observations: &[(u64, u64)], shots: u64, grid: usize) -> f64 {
    let mut best_theta = 0.0;
    let mut best_ll = f64::NEG_INFINITY;

    for g in 0..grid {
        let theta = (g as f64 + 0.5) * std::f64::consts::FRAC_PI_2 / grid as f64;
        let mut ll = 0.0;
        for &(m, hits) in observations {
            let angle = (2 * m + 1) as f64 * theta;
            let p = angle.sin().powi(2).clamp(1e-12, 1.0 - 1e-12);
            ll += hits as f64 * p.ln() + (shots - hits) as f64 * (1.0 - p).ln();
        }
        if ll > best_ll {
            best_ll = ll;
            best_theta = theta;
        }
    }

    best_theta.sin()
}

/// Mapped: invert the Gaussian CDF at the encoded threshold. The estimated
/// amplitude squared is a truncated-grid tail mass, so it is rescaled to the
/// untruncated tail before inversion.
fn map_amplitude(cfg: &QuantumConfig, tau: f64, amplitude: f64) -> Result<f64, StageFailure> {
    let std_normal = Normal::new(0.0, 1.0).map_err(|e| StageFailure {
        stage: "mapped",
        reason: e.to_string(),
    })?;
    let edge = std_normal.cdf(-GRID_WIDTH_SIGMAS);
    let truncated_mass = 1.0 - 2.0 * edge;
    let tail = amplitude * amplitude * truncated_mass + edge;

    if tail <= 1e-9 || tail >= 1.0 - 1e-9 {
        return Err(StageFailure {
            stage: "mapped",
            reason: format!("tail probability {tail} out of invertible range"),
        });
    }
    let z = std_normal.inverse_cdf(tail);
    if z.abs() < 1e-6 {
        return Err(StageFailure {
            stage: "mapped",
            reason: "threshold quantile too close to the median".into(),
        });
    }
    let sigma = tau / z;
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(StageFailure {
            stage: "mapped",
            reason: format!("implied volatility {sigma} not usable (qubits={})", cfg.price_qubits),
        });
    }
    Ok(sigma)
}
