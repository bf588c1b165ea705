//! Analytics collector: wraps a run to record execution time and process
//! resource usage, and computes the mode-agnostic statistical and
//! sensitivity metrics over the per-step volatility curve.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use sysinfo::{Pid, System};
use tracing::debug;

use crate::classical::ClassicalMetrics;
use crate::hybrid::HybridMetrics;
use crate::model::Mode;
use crate::quantum::QuantumMetrics;
use crate::result::{nan_null, nan_pair};

/// Wall-clock and process-resource figures for one run. Resource numbers
/// are process-global and therefore best-effort when several runs share the
/// process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_execution_time_secs: f64,
    #[serde(with = "nan_null")]
    pub throughput_steps_per_second: f64,
    pub steps_processed: usize,
    #[serde(with = "nan_null")]
    pub memory_usage_mb: f64,
    #[serde(with = "nan_null")]
    pub cpu_usage_percent: f64,
}

/// Distributional summary of the per-step daily volatilities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatisticalMetrics {
    #[serde(with = "nan_pair")]
    pub confidence_interval_95: (f64, f64),
    #[serde(with = "nan_null")]
    pub coefficient_of_variation: f64,
    #[serde(with = "nan_null")]
    pub skewness: f64,
    #[serde(with = "nan_null")]
    pub kurtosis: f64,
    #[serde(with = "nan_null")]
    pub standard_error: f64,
    #[serde(with = "nan_null")]
    pub median: f64,
    #[serde(with = "nan_null")]
    pub interquartile_range: f64,
    pub sample_size: usize,
}

/// Shape of the sensitivity curve itself.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensitivityMetrics {
    #[serde(with = "nan_null")]
    pub baseline_portfolio_volatility_daily: f64,
    #[serde(with = "nan_pair")]
    pub portfolio_volatility_range: (f64, f64),
    /// Swept parameter value at the steepest finite-difference segment
    /// (right endpoint, first occurrence on ties).
    #[serde(with = "nan_null")]
    pub max_sensitivity_point: f64,
    #[serde(with = "nan_null")]
    pub curve_steepness: f64,
    #[serde(with = "nan_null")]
    pub percentile_95_volatility: f64,
}

/// The complete analytics payload attached to a test run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsBundle {
    pub mode: Mode,
    pub performance_metrics: PerformanceMetrics,
    pub statistical_metrics: StatisticalMetrics,
    pub sensitivity_metrics: SensitivityMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classical_metrics: Option<ClassicalMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantum_metrics: Option<QuantumMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid_metrics: Option<HybridMetrics>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Collector
// ──────────────────────────────────────────────────────────────────────────────

/// Samples process RSS and CPU through sysinfo. The very first CPU reading
/// of a process is always zero and is discarded.
struct ResourceSampler {
    system: System,
    pid: Pid,
    initial_rss_bytes: u64,
    peak_rss_bytes: u64,
    cpu_samples: Vec<f64>,
    refreshes: usize,
}

impl ResourceSampler {
    fn start() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let pid = Pid::from_u32(std::process::id());
        let initial = system.process(pid).map(|p| p.memory()).unwrap_or(0);
        Self {
            system,
            pid,
            initial_rss_bytes: initial,
            peak_rss_bytes: initial,
            cpu_samples: Vec::new(),
            refreshes: 0,
        }
    }

    fn sample(&mut self) {
        self.system.refresh_all();
        self.refreshes += 1;
        if let Some(process) = self.system.process(self.pid) {
            self.peak_rss_bytes = self.peak_rss_bytes.max(process.memory());
            if self.refreshes > 1 {
                self.cpu_samples.push(process.cpu_usage() as f64);
            }
        }
    }

    fn memory_usage_mb(&self) -> f64 {
        (self.peak_rss_bytes.saturating_sub(self.initial_rss_bytes)) as f64 / (1024.0 * 1024.0)
    }

    fn cpu_usage_percent(&self) -> f64 {
        if self.cpu_samples.is_empty() {
            return f64::NAN;
        }
        self.cpu_samples.iter().sum::<f64>() / self.cpu_samples.len() as f64
    }
}

/// Lifetime companion of one run: created before the baseline is computed,
/// sampled at suspension points, finished after the last step.
pub struct RunCollector {
    started: Instant,
    sampler: ResourceSampler,
}

impl RunCollector {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            sampler: ResourceSampler::start(),
        }
    }

    /// Called by the engine at step boundaries.
    pub fn sample(&mut self) {
        self.sampler.sample();
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Finalizes the mode-agnostic metrics over the completed curve.
    /// `volatilities` and `swept_values` are index-aligned.
    pub fn finish(
        mut self,
        baseline_daily: f64,
        swept_values: &[f64],
        volatilities: &[f64],
    ) -> (PerformanceMetrics, StatisticalMetrics, SensitivityMetrics) {
        self.sampler.sample();
        let elapsed = self.elapsed_secs();
        let steps = volatilities.len();

        let performance = PerformanceMetrics {
            total_execution_time_secs: elapsed,
            throughput_steps_per_second: if elapsed > 0.0 {
                steps as f64 / elapsed
            } else {
                f64::NAN
            },
            steps_processed: steps,
            memory_usage_mb: self.sampler.memory_usage_mb(),
            cpu_usage_percent: self.sampler.cpu_usage_percent(),
        };
        debug!(
            elapsed_secs = elapsed,
            steps, "run collector finished"
        );

        let statistical = statistical_metrics(volatilities);
        let sensitivity = sensitivity_metrics(baseline_daily, swept_values, volatilities);
        (performance, statistical, sensitivity)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Statistical metrics
// ──────────────────────────────────────────────────────────────────────────────

pub fn statistical_metrics(volatilities: &[f64]) -> StatisticalMetrics {
    let finite: Vec<f64> = volatilities.iter().cloned().filter(|v| v.is_finite()).collect();
    let n = finite.len();

    if n == 0 {
        return StatisticalMetrics {
            confidence_interval_95: (f64::NAN, f64::NAN),
            coefficient_of_variation: f64::NAN,
            skewness: f64::NAN,
            kurtosis: f64::NAN,
            standard_error: f64::NAN,
            median: f64::NAN,
            interquartile_range: f64::NAN,
            sample_size: 0,
        };
    }

    let nf = n as f64;
    let mean = finite.iter().sum::<f64>() / nf;
    let variance = if n > 1 {
        finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0)
    } else {
        f64::NAN
    };
    let std = variance.sqrt();
    let standard_error = std / nf.sqrt();

    let confidence_interval_95 = if n > 1 && std.is_finite() {
        match StudentsT::new(0.0, 1.0, nf - 1.0) {
            Ok(t) => {
                let half = t.inverse_cdf(0.975) * standard_error;
                (mean - half, mean + half)
            }
            Err(_) => (f64::NAN, f64::NAN),
        }
    } else {
        (f64::NAN, f64::NAN)
    };

    let coefficient_of_variation = if mean != 0.0 { std / mean } else { f64::NAN };

    // Fisher moment coefficients with population denominators.
    let (skewness, kurtosis) = if n > 1 {
        let m2 = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / nf;
        if m2 > 0.0 {
            let m3 = finite.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / nf;
            let m4 = finite.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / nf;
            (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
        } else {
            (f64::NAN, f64::NAN)
        }
    } else {
        (f64::NAN, f64::NAN)
    };

    let mut sorted = finite.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values are ordered"));

    StatisticalMetrics {
        confidence_interval_95,
        coefficient_of_variation,
        skewness,
        kurtosis,
        standard_error,
        median: percentile(&sorted, 0.5),
        interquartile_range: percentile(&sorted, 0.75) - percentile(&sorted, 0.25),
        sample_size: n,
    }
}

/// Linear-interpolation percentile over an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * q;
            let lo = h.floor() as usize;
            let hi = h.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Sensitivity metrics
// ──────────────────────────────────────────────────────────────────────────────

pub fn sensitivity_metrics(
    baseline_daily: f64,
    swept_values: &[f64],
    volatilities: &[f64],
) -> SensitivityMetrics {
    let finite: Vec<f64> = volatilities.iter().cloned().filter(|v| v.is_finite()).collect();
    let range = if finite.is_empty() {
        (f64::NAN, f64::NAN)
    } else {
        (
            finite.iter().cloned().fold(f64::INFINITY, f64::min),
            finite.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        )
    };

    let mut sorted = finite;
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values are ordered"));
    let p95 = percentile(&sorted, 0.95);

    // Steepest finite-difference segment over adjacent finite pairs.
    let mut max_slope = f64::NAN;
    let mut max_point = f64::NAN;
    for i in 1..volatilities.len() {
        let (v0, v1) = (volatilities[i - 1], volatilities[i]);
        if !v0.is_finite() || !v1.is_finite() {
            continue;
        }
        let dv = swept_values[i] - swept_values[i - 1];
        if dv == 0.0 {
            continue;
        }
        let slope = ((v1 - v0) / dv).abs();
        if max_slope.is_nan() || slope > max_slope {
            max_slope = slope;
            max_point = swept_values[i];
        }
    }

    SensitivityMetrics {
        baseline_portfolio_volatility_daily: baseline_daily,
        portfolio_volatility_range: range,
        max_sensitivity_point: max_point,
        curve_steepness: max_slope,
        percentile_95_volatility: p95,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn mean_lies_inside_the_confidence_interval() {
        let v = [0.10, 0.12, 0.11, 0.13, 0.115];
        let stats = statistical_metrics(&v);
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        assert!(stats.confidence_interval_95.0 <= mean);
        assert!(mean <= stats.confidence_interval_95.1);
        assert!(stats.standard_error > 0.0);
        assert_eq!(stats.sample_size, 5);
    }

    #[test]
    fn nan_steps_are_excluded_from_sample_size() {
        let v = [0.10, f64::NAN, 0.12, 0.14];
        let stats = statistical_metrics(&v);
        assert_eq!(stats.sample_size, 3);
        assert_relative_eq!(stats.median, 0.12, max_relative = 1e-12);
    }

    #[test]
    fn empty_input_is_all_nan() {
        let stats = statistical_metrics(&[]);
        assert_eq!(stats.sample_size, 0);
        assert!(stats.median.is_nan());
        assert!(stats.confidence_interval_95.0.is_nan());
    }

    #[test]
    fn symmetric_data_has_near_zero_skewness() {
        let v = [0.1, 0.2, 0.3, 0.4, 0.5];
        let stats = statistical_metrics(&v);
        assert_abs_diff_eq!(stats.skewness, 0.0, epsilon = 1e-12);
        assert_relative_eq!(stats.median, 0.3, max_relative = 1e-12);
        assert_relative_eq!(stats.interquartile_range, 0.2, max_relative = 1e-12);
    }

    #[test]
    fn uniform_grid_kurtosis_is_platykurtic() {
        let v = [0.1, 0.2, 0.3, 0.4, 0.5];
        let stats = statistical_metrics(&v);
        assert!(stats.kurtosis < 0.0, "uniform-ish data has negative excess kurtosis");
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(percentile(&sorted, 0.5), 2.5, max_relative = 1e-12);
        assert_relative_eq!(percentile(&sorted, 0.0), 1.0, max_relative = 1e-12);
        assert_relative_eq!(percentile(&sorted, 1.0), 4.0, max_relative = 1e-12);
    }

    #[test]
    fn steepest_segment_is_located() {
        let values = [0.1, 0.2, 0.3];
        let vols = [0.10, 0.11, 0.20];
        let s = sensitivity_metrics(0.1, &values, &vols);
        assert_relative_eq!(s.curve_steepness, 0.9, max_relative = 1e-9);
        assert_relative_eq!(s.max_sensitivity_point, 0.3, max_relative = 1e-12);
        assert_eq!(s.portfolio_volatility_range, (0.10, 0.20));
    }

    #[test]
    fn slope_skips_nan_segments() {
        let values = [0.1, 0.2, 0.3, 0.4];
        let vols = [0.10, f64::NAN, 0.30, 0.31];
        let s = sensitivity_metrics(0.1, &values, &vols);
        // Only the 0.3 → 0.4 segment has two finite endpoints.
        assert_relative_eq!(s.curve_steepness, 0.1, max_relative = 1e-9);
        assert_relative_eq!(s.max_sensitivity_point, 0.4, max_relative = 1e-12);
    }

    #[test]
    fn collector_reports_elapsed_time_and_steps() {
        let collector = RunCollector::start();
        let (perf, stats, sens) = collector.finish(0.1, &[0.1, 0.2], &[0.10, 0.12]);
        assert!(perf.total_execution_time_secs >= 0.0);
        assert_eq!(perf.steps_processed, 2);
        assert_eq!(stats.sample_size, 2);
        assert_relative_eq!(
            sens.baseline_portfolio_volatility_daily,
            0.1,
            max_relative = 1e-12
        );
    }
}
