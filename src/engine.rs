//! Run orchestration: validates the request, expands the sweep, dispatches
//! the selected estimator, and assembles the final test run with analytics
//! and flags.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use sysinfo::System;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::{AnalyticsBundle, RunCollector};
use crate::cancel::RunContext;
use crate::classical::{self, ClassicalMetrics, ClassicalPoint};
use crate::config::{DEFAULT_NUM_ANCHORS, MC_BATCH_SIZE, MC_SAMPLES, MLE_GRID_POINTS};
use crate::error::EngineError;
use crate::hybrid::{self, HybridMetrics};
use crate::model::{Mode, RunRequest};
use crate::quantum::{self, QuantumConfig, QuantumMetrics, QuantumPoint};
use crate::result::{StepFlags, StepResult, SweepResult, TestRun};
use crate::sweep::SweepPlan;
use crate::validate;

/// Intermediate product of one estimator sweep, before assembly.
struct SweepExecution {
    baseline_daily: f64,
    steps: Vec<StepResult>,
    classical_metrics: Option<ClassicalMetrics>,
    quantum_metrics: Option<QuantumMetrics>,
    hybrid_metrics: Option<HybridMetrics>,
    cancelled: bool,
    gp_fallback: bool,
    used_surrogate: bool,
}

/// Validates and executes a run request. Cancellation (explicit or via the
/// deadline) yields a partial test run with `cancelled` set; validation
/// failures reject the run with no partial output.
pub fn run(
    request: &RunRequest,
    project_id: &str,
    ctx: &RunContext,
) -> Result<TestRun, EngineError> {
    run_with_observer(request, project_id, ctx, |_| {})
}

/// Like [`run`], invoking `on_step` with the completed-step count after each
/// step finishes. External collaborators use this for progress display.
pub fn run_with_observer(
    request: &RunRequest,
    project_id: &str,
    ctx: &RunContext,
    mut on_step: impl FnMut(usize),
) -> Result<TestRun, EngineError> {
    let validated = validate::validate(request)?;
    let plan = SweepPlan::new(validated.portfolio, validated.spec);
    let seed = request.seed.unwrap_or(0);

    let mut system = System::new();
    system.refresh_memory();
    ensure_workspace(
        estimated_workspace_bytes(&plan, request),
        system.available_memory(),
    )?;

    info!(
        mode = request.mode.as_str(),
        param = plan.spec().param.as_str(),
        asset = %plan.spec().asset,
        steps = plan.len(),
        seed,
        "starting sensitivity run"
    );

    let mut collector = RunCollector::start();
    let execution = match request.mode {
        Mode::Classical => run_classical(&plan, seed, ctx, &mut collector, &mut on_step),
        Mode::Quantum => {
            let cfg = QuantumConfig::from_options(request.quantum_options.as_ref());
            run_quantum(&plan, &cfg, seed, ctx, &mut collector, &mut on_step)
        }
        Mode::Hybrid => {
            let cfg = QuantumConfig::from_options(request.quantum_options.as_ref());
            let anchors = request
                .hybrid_options
                .and_then(|h| h.num_anchors)
                .unwrap_or(DEFAULT_NUM_ANCHORS);
            run_hybrid(&plan, &cfg, anchors, seed, ctx, &mut on_step)
        }
    };

    let SweepExecution {
        baseline_daily,
        steps,
        classical_metrics,
        quantum_metrics,
        hybrid_metrics,
        cancelled,
        gp_fallback,
        used_surrogate,
    } = execution;

    let completed = steps.len();
    if cancelled {
        warn!(completed, planned = plan.len(), "run cancelled; assembling partial result");
    }

    let sigmas: Vec<f64> = steps.iter().map(|s| s.portfolio_volatility_daily).collect();
    let (performance, statistical, sensitivity) =
        collector.finish(baseline_daily, &plan.values()[..completed], &sigmas);

    let analytics = AnalyticsBundle {
        mode: request.mode,
        performance_metrics: performance,
        statistical_metrics: statistical,
        sensitivity_metrics: sensitivity,
        classical_metrics,
        quantum_metrics,
        hybrid_metrics,
    };

    let results = SweepResult {
        perturbation: plan.spec().param,
        asset: plan.spec().asset.clone(),
        range_tested: plan.values().to_vec(),
        baseline_portfolio_volatility_daily: baseline_daily,
        baseline_portfolio_volatility_annualized: crate::kernel::annualize(baseline_daily),
        results: steps,
    };

    let flags = assemble_flags(cancelled, gp_fallback, used_surrogate, &results);

    Ok(TestRun {
        test_run_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        project_id: project_id.to_string(),
        block_type: request.mode,
        parameters: request.clone(),
        results,
        analytics,
        flags,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Mode executors
// ──────────────────────────────────────────────────────────────────────────────

fn run_classical(
    plan: &SweepPlan,
    seed: u64,
    ctx: &RunContext,
    collector: &mut RunCollector,
    on_step: &mut dyn FnMut(usize),
) -> SweepExecution {
    let started = Instant::now();
    let baseline = classical::simulate_volatility(plan.baseline(), seed, ctx.token());
    let baseline_daily = baseline.as_ref().map(|p| p.sigma_daily).unwrap_or(f64::NAN);

    let mut points: Vec<ClassicalPoint> = Vec::with_capacity(plan.len());
    let mut steps = Vec::with_capacity(plan.len());
    let mut cancelled = baseline.is_none();

    if !cancelled {
        for i in 0..plan.len() {
            if ctx.poll() {
                cancelled = true;
                break;
            }
            collector.sample();
            let variant = plan.variant(i);
            match classical::simulate_volatility(&variant, seed.wrapping_add(i as u64), ctx.token())
            {
                Some(point) => {
                    steps.push(StepResult::new(
                        plan.values()[i],
                        point.sigma_daily,
                        baseline_daily,
                        StepFlags {
                            non_psd: point.non_psd,
                            quantum_fallback: false,
                        },
                    ));
                    points.push(point);
                    on_step(steps.len());
                }
                None => {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    SweepExecution {
        baseline_daily,
        steps,
        classical_metrics: Some(aggregate_classical(&points, baseline.as_ref(), elapsed)),
        quantum_metrics: None,
        hybrid_metrics: None,
        cancelled,
        gp_fallback: false,
        used_surrogate: false,
    }
}

fn aggregate_classical(
    points: &[ClassicalPoint],
    baseline: Option<&ClassicalPoint>,
    elapsed: f64,
) -> ClassicalMetrics {
    let finite: Vec<&ClassicalPoint> = points.iter().filter(|p| p.sigma_daily.is_finite()).collect();
    let total_samples: usize = points.iter().map(|p| p.samples_drawn).sum::<usize>()
        + baseline.map(|p| p.samples_drawn).unwrap_or(0);

    let mean_of = |extract: fn(&ClassicalPoint) -> f64| -> f64 {
        if finite.is_empty() {
            f64::NAN
        } else {
            finite.iter().map(|p| extract(p)).sum::<f64>() / finite.len() as f64
        }
    };

    ClassicalMetrics {
        simulations_per_second: if elapsed > 0.0 {
            total_samples as f64 / elapsed
        } else {
            f64::NAN
        },
        iterations_per_second: if elapsed > 0.0 {
            (MC_SAMPLES * points.len()) as f64 / elapsed
        } else {
            f64::NAN
        },
        convergence_rate: mean_of(|p| p.convergence_rate),
        monte_carlo_efficiency: mean_of(|p| p.efficiency),
        standard_error: mean_of(|p| p.standard_error),
        samples_per_step: MC_SAMPLES,
    }
}

fn run_quantum(
    plan: &SweepPlan,
    cfg: &QuantumConfig,
    seed: u64,
    ctx: &RunContext,
    collector: &mut RunCollector,
    on_step: &mut dyn FnMut(usize),
) -> SweepExecution {
    let started = Instant::now();
    let baseline = quantum::estimate_point(plan.baseline(), cfg, seed, ctx.token());
    let baseline_daily = baseline.as_ref().map(|p| p.sigma_daily).unwrap_or(f64::NAN);

    let mut points: Vec<QuantumPoint> = Vec::with_capacity(plan.len());
    let mut steps = Vec::with_capacity(plan.len());
    let mut cancelled = baseline.is_none();

    if !cancelled {
        for i in 0..plan.len() {
            if ctx.poll() {
                cancelled = true;
                break;
            }
            collector.sample();
            let variant = plan.variant(i);
            match quantum::estimate_point(&variant, cfg, seed.wrapping_add(i as u64), ctx.token()) {
                Some(point) => {
                    steps.push(StepResult::new(
                        plan.values()[i],
                        point.sigma_daily,
                        baseline_daily,
                        StepFlags {
                            non_psd: point.non_psd,
                            quantum_fallback: point.fallback,
                        },
                    ));
                    points.push(point);
                    on_step(steps.len());
                }
                None => {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let used_surrogate = points.iter().any(|p| p.used_surrogate)
        || baseline.as_ref().map(|p| p.used_surrogate).unwrap_or(false);

    SweepExecution {
        baseline_daily,
        steps,
        classical_metrics: None,
        quantum_metrics: Some(aggregate_quantum(&points, cfg, elapsed)),
        hybrid_metrics: None,
        cancelled,
        gp_fallback: false,
        used_surrogate,
    }
}

fn aggregate_quantum(points: &[QuantumPoint], cfg: &QuantumConfig, elapsed: f64) -> QuantumMetrics {
    let total_gates: usize = points.iter().map(|p| p.profile.gates).sum();
    let total_circuits: usize = points.iter().map(|p| p.profile.circuits).sum();
    let total_shots: u64 = points.iter().map(|p| p.shots_fired).sum();
    let max_depth = points.iter().map(|p| p.profile.depth).max().unwrap_or(0);

    // Enhancement is only meaningful where a genuine quantum estimate and a
    // classical reference both exist.
    let ratios: Vec<f64> = points
        .iter()
        .filter(|p| !p.fallback && p.sigma_daily.is_finite() && p.surrogate_sigma > 0.0)
        .map(|p| p.sigma_daily / p.surrogate_sigma)
        .collect();
    let enhancement = if ratios.is_empty() {
        f64::NAN
    } else {
        ratios.iter().sum::<f64>() / ratios.len() as f64
    };

    let surrogates: Vec<f64> = points
        .iter()
        .filter(|p| p.used_surrogate && p.surrogate_sigma.is_finite())
        .map(|p| p.surrogate_sigma)
        .collect();
    let surrogate_mean = if surrogates.is_empty() {
        f64::NAN
    } else {
        surrogates.iter().sum::<f64>() / surrogates.len() as f64
    };

    QuantumMetrics {
        circuit_depth: max_depth,
        total_qubits: cfg.total_qubits(),
        quantum_operations: total_gates,
        shots_per_second: if elapsed > 0.0 {
            total_shots as f64 / elapsed
        } else {
            f64::NAN
        },
        circuits_per_second: if elapsed > 0.0 {
            total_circuits as f64 / elapsed
        } else {
            f64::NAN
        },
        enhancement_factor: enhancement,
        quantum_advantage_ratio: (enhancement - 1.0).abs(),
        classical_surrogate_sigma: surrogate_mean,
    }
}

fn run_hybrid(
    plan: &SweepPlan,
    cfg: &QuantumConfig,
    num_anchors: usize,
    seed: u64,
    ctx: &RunContext,
    on_step: &mut dyn FnMut(usize),
) -> SweepExecution {
    let baseline = classical::simulate_volatility(plan.baseline(), seed, ctx.token());
    let baseline_daily = baseline.as_ref().map(|p| p.sigma_daily).unwrap_or(f64::NAN);

    if baseline.is_none() {
        return SweepExecution {
            baseline_daily,
            steps: Vec::new(),
            classical_metrics: None,
            quantum_metrics: None,
            hybrid_metrics: None,
            cancelled: true,
            gp_fallback: false,
            used_surrogate: false,
        };
    }

    let outcome = hybrid::run_sweep(plan, cfg, num_anchors, seed, ctx, on_step);

    let mut steps = Vec::with_capacity(outcome.sigma.len());
    for (i, &sigma) in outcome.sigma.iter().enumerate() {
        let anchor_slot = outcome.anchors.iter().position(|&a| a == i);
        let quantum_fallback = anchor_slot
            .and_then(|slot| outcome.quantum_points.get(slot))
            .map(|p| p.fallback)
            .unwrap_or(false);
        steps.push(StepResult::new(
            plan.values()[i],
            sigma,
            baseline_daily,
            StepFlags {
                non_psd: outcome.classical_points[i].non_psd,
                quantum_fallback,
            },
        ));
    }

    let used_surrogate = outcome.quantum_points.iter().any(|p| p.used_surrogate);

    SweepExecution {
        baseline_daily,
        steps,
        classical_metrics: None,
        quantum_metrics: None,
        hybrid_metrics: Some(outcome.metrics),
        cancelled: outcome.cancelled,
        gp_fallback: outcome.gp_fallback,
        used_surrogate,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Workspace guard
// ──────────────────────────────────────────────────────────────────────────────

/// Headroom multiplier on the workspace estimate: allocator slack, the
/// collector's sysinfo snapshots, and transient clones during assembly.
const WORKSPACE_MARGIN: u64 = 4;

/// Upper bound on the transient workspace one run allocates: the
/// Monte-Carlo draw batch and convergence checkpoints, the quantum cell
/// table and likelihood grid, the GP Gram matrices with their leave-one-out
/// scratch, covariance copies per variant, and the per-step records.
fn estimated_workspace_bytes(plan: &SweepPlan, request: &RunRequest) -> u64 {
    const F64: u64 = std::mem::size_of::<f64>() as u64;
    let n = plan.baseline().num_assets() as u64;
    let steps = plan.len() as u64;

    // Covariance matrix, its factor, and the eigen fallback per variant.
    let covariance = 3 * n * n * F64;
    let classical = (MC_BATCH_SIZE as u64 * n + (MC_SAMPLES as u64 / 10)) * F64 + covariance;

    let cfg = QuantumConfig::from_options(request.quantum_options.as_ref());
    let quantum = ((1u64 << cfg.price_qubits) + MLE_GRID_POINTS as u64) * F64 + covariance;

    // Gram matrix over at most `steps` anchors plus LOO refits.
    let gp = 2 * steps * steps * F64;
    // Step results, flags, and the analytics bundle.
    let records = steps * 512 + 4096;

    let compute = match request.mode {
        Mode::Classical => classical,
        // Quantum points fall back to the closed form, not to sampling, so
        // the classical batch never coexists with the circuit tables.
        Mode::Quantum => quantum,
        Mode::Hybrid => classical + quantum + gp,
    };
    (compute + records) * WORKSPACE_MARGIN
}

/// Rejects the run outright when the host cannot hold its workspace; a
/// run-level failure with no partial result. An `available` of zero means
/// the platform reported no figure, and the check is skipped rather than
/// guessed.
fn ensure_workspace(required: u64, available: u64) -> Result<(), EngineError> {
    if available > 0 && available < required {
        return Err(EngineError::ResourceExhaustion(format!(
            "run needs ~{required} bytes of workspace but only {available} bytes are available"
        )));
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// Flags
// ──────────────────────────────────────────────────────────────────────────────

fn assemble_flags(
    cancelled: bool,
    gp_fallback: bool,
    used_surrogate: bool,
    results: &SweepResult,
) -> BTreeMap<String, serde_json::Value> {
    let mut flags = BTreeMap::new();
    if cancelled {
        flags.insert("cancelled".to_string(), json!(true));
    }
    if gp_fallback {
        flags.insert("gp_fallback".to_string(), json!(true));
    }
    if used_surrogate {
        flags.insert("quantum_tail_surrogate".to_string(), json!(true));
    }
    // Resource counters are process-global; parallel runs share them.
    flags.insert(
        "resource_metrics_scope".to_string(),
        json!("process-wide, best-effort"),
    );

    let mut non_finite = serde_json::Map::new();
    if !results.baseline_portfolio_volatility_daily.is_finite() {
        non_finite.insert(
            "baseline_portfolio_volatility_daily".to_string(),
            json!("cancelled before baseline"),
        );
    }
    for (i, step) in results.results.iter().enumerate() {
        if !step.portfolio_volatility_daily.is_finite() {
            let reason = if step.flags.non_psd { "non_psd" } else { "unavailable" };
            non_finite.insert(
                format!("results[{i}].portfolio_volatility_daily"),
                json!(reason),
            );
        }
    }
    if gp_fallback {
        non_finite.insert(
            "analytics.hybrid_metrics.gp_interpolation_mse".to_string(),
            json!("gp_fallback"),
        );
    }
    if !non_finite.is_empty() {
        flags.insert(
            "non_finite".to_string(),
            serde_json::Value::Object(non_finite),
        );
    }
    flags
}
