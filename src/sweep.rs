//! Perturbation planner: expands a validated (portfolio, spec) pair into the
//! ordered sweep of concrete portfolio variants.

use crate::model::{PerturbParam, PerturbSpec, Portfolio};

/// The fully-expanded sweep plan. `variant(i)` is pure, so iterating the
/// plan twice yields identical portfolios.
#[derive(Clone, Debug)]
pub struct SweepPlan {
    portfolio: Portfolio,
    spec: PerturbSpec,
    values: Vec<f64>,
}

impl SweepPlan {
    pub fn new(portfolio: Portfolio, spec: PerturbSpec) -> Self {
        let values = linspace(spec.range.0, spec.range.1, spec.steps);
        Self {
            portfolio,
            spec,
            values,
        }
    }

    /// The swept parameter values, endpoint-inclusive and ascending.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn spec(&self) -> &PerturbSpec {
        &self.spec
    }

    pub fn baseline(&self) -> &Portfolio {
        &self.portfolio
    }

    /// The portfolio variant for step `i`, with exactly one scalar replaced.
    pub fn variant(&self, i: usize) -> Portfolio {
        let value = self.values[i];
        let mut variant = self.portfolio.clone();
        let a = self.spec.asset_index;

        match self.spec.param {
            PerturbParam::Volatility => {
                variant.volatility[a] = value;
            }
            PerturbParam::Weight => {
                substitute_weight(&mut variant.weights, a, value);
            }
            PerturbParam::Correlation => {
                let n = variant.correlation_matrix.len();
                for k in 0..n {
                    if k != a {
                        variant.correlation_matrix[a][k] = value;
                        variant.correlation_matrix[k][a] = value;
                    }
                }
            }
        }

        variant
    }

    /// Restartable iteration over (swept value, variant) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, Portfolio)> + '_ {
        (0..self.len()).map(move |i| (self.values[i], self.variant(i)))
    }
}

/// Sets `weights[asset] = value` and rescales the remaining weights
/// proportionally so the total stays 1. When every other weight is zero the
/// residual mass is spread uniformly.
fn substitute_weight(weights: &mut [f64], asset: usize, value: f64) {
    let rest: f64 = weights
        .iter()
        .enumerate()
        .filter(|(k, _)| *k != asset)
        .map(|(_, w)| *w)
        .sum();

    let residual = 1.0 - value;
    let n = weights.len();

    for k in 0..n {
        if k == asset {
            continue;
        }
        weights[k] = if rest > f64::EPSILON {
            weights[k] / rest * residual
        } else if n > 1 {
            residual / (n - 1) as f64
        } else {
            0.0
        };
    }
    weights[asset] = value;
}

/// Endpoint-inclusive linear grid. The first and last entries are the exact
/// range bounds, not floating-point approximations of them.
fn linspace(min: f64, max: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![min];
    }
    let span = max - min;
    let mut values: Vec<f64> = (0..steps)
        .map(|i| min + span * i as f64 / (steps - 1) as f64)
        .collect();
    values[0] = min;
    values[steps - 1] = max;
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn plan(param: PerturbParam, range: (f64, f64), steps: usize) -> SweepPlan {
        let portfolio = Portfolio {
            assets: vec!["A".into(), "B".into(), "C".into()],
            weights: vec![0.5, 0.3, 0.2],
            volatility: vec![0.1, 0.2, 0.3],
            correlation_matrix: vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
            ],
        };
        let spec = PerturbSpec {
            param,
            asset: "A".into(),
            asset_index: 0,
            range,
            steps,
        };
        SweepPlan::new(portfolio, spec)
    }

    #[test]
    fn grid_is_endpoint_inclusive_and_evenly_spaced() {
        let p = plan(PerturbParam::Volatility, (0.1, 0.3), 3);
        assert_eq!(p.values(), &[0.1, 0.2, 0.3]);
        assert_eq!(p.values()[0], 0.1);
        assert_eq!(p.values()[2], 0.3);
    }

    #[test]
    fn volatility_variant_replaces_exactly_one_sigma() {
        let p = plan(PerturbParam::Volatility, (0.1, 0.3), 3);
        let v = p.variant(1);
        assert_eq!(v.volatility, vec![0.2, 0.2, 0.3]);
        assert_eq!(v.weights, p.baseline().weights);
    }

    #[test]
    fn weight_variant_renormalizes_proportionally() {
        let p = plan(PerturbParam::Weight, (0.0, 1.0), 5);
        let v = p.variant(1); // swept weight 0.25
        assert_abs_diff_eq!(v.weights[0], 0.25, epsilon = 1e-12);
        // Remaining 0.75 split 3:2 like the original 0.3:0.2.
        assert_abs_diff_eq!(v.weights[1], 0.45, epsilon = 1e-12);
        assert_abs_diff_eq!(v.weights[2], 0.30, epsilon = 1e-12);
        let sum: f64 = v.weights.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn weight_variant_at_one_zeroes_the_rest() {
        let p = plan(PerturbParam::Weight, (0.0, 1.0), 5);
        let v = p.variant(4);
        assert_eq!(v.weights[0], 1.0);
        assert_abs_diff_eq!(v.weights[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v.weights[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_rest_mass_spreads_uniformly() {
        let mut weights = vec![1.0, 0.0, 0.0];
        substitute_weight(&mut weights, 0, 0.4);
        assert_abs_diff_eq!(weights[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[1], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[2], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn correlation_variant_sets_row_and_column() {
        let p = plan(PerturbParam::Correlation, (-0.5, 0.5), 3);
        let v = p.variant(2);
        assert_eq!(v.correlation_matrix[0][1], 0.5);
        assert_eq!(v.correlation_matrix[1][0], 0.5);
        assert_eq!(v.correlation_matrix[0][2], 0.5);
        assert_eq!(v.correlation_matrix[2][0], 0.5);
        assert_eq!(v.correlation_matrix[0][0], 1.0);
        assert_eq!(v.correlation_matrix[1][2], 0.0);
    }

    #[test]
    fn reiteration_yields_identical_variants() {
        let p = plan(PerturbParam::Weight, (0.1, 0.9), 7);
        let first: Vec<_> = p.iter().collect();
        let second: Vec<_> = p.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn weight_sweep_sum_invariant_holds_at_every_step() {
        let p = plan(PerturbParam::Weight, (0.0, 1.0), 11);
        for (_, variant) in p.iter() {
            let sum: f64 = variant.weights.iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }
}
