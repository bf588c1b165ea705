//! Whole-request validation. Collects every offending field before
//! rejecting, so a caller can surface the complete list at once.

use std::collections::HashSet;

use crate::config::{MAX_ASSETS, MAX_STEPS, MIN_STEPS, WEIGHT_SUM_TOL};
use crate::error::{FieldIssue, ValidationError};
use crate::kernel;
use crate::model::{PerturbParam, PerturbSpec, Portfolio, RunRequest};

/// A request that passed validation. The portfolio and spec are immutable
/// from here on; estimators only ever see derived copies.
#[derive(Clone, Debug)]
pub struct ValidatedRequest {
    pub portfolio: Portfolio,
    pub spec: PerturbSpec,
}

/// Validates the request, returning either the validated (portfolio, spec)
/// pair or a `ValidationError` listing all offending fields.
pub fn validate(request: &RunRequest) -> Result<ValidatedRequest, ValidationError> {
    let mut issues = Vec::new();

    validate_portfolio(&request.portfolio, &mut issues);
    let asset_index = validate_perturbation(request, &mut issues);
    validate_options(request, &mut issues);

    if !issues.is_empty() {
        return Err(ValidationError::new(issues));
    }

    Ok(ValidatedRequest {
        portfolio: request.portfolio.clone(),
        spec: PerturbSpec {
            param: request.param,
            asset: request.asset.clone(),
            asset_index: asset_index.expect("asset index resolved when no issues recorded"),
            range: request.range,
            steps: request.steps,
        },
    })
}

fn validate_portfolio(portfolio: &Portfolio, issues: &mut Vec<FieldIssue>) {
    let n = portfolio.num_assets();

    if n == 0 || n > MAX_ASSETS {
        issues.push(FieldIssue::new(
            "portfolio.assets",
            format!("expected between 1 and {MAX_ASSETS} assets, got {n}"),
        ));
    }

    let mut seen = HashSet::new();
    for symbol in &portfolio.assets {
        if symbol.trim().is_empty() {
            issues.push(FieldIssue::new("portfolio.assets", "asset symbols must be non-empty"));
        }
        if !seen.insert(symbol.as_str()) {
            issues.push(FieldIssue::new(
                "portfolio.assets",
                format!("duplicate asset symbol '{symbol}'"),
            ));
        }
    }

    let mut shape_ok = n > 0;

    if portfolio.weights.len() != n {
        issues.push(FieldIssue::new(
            "portfolio.weights",
            format!("expected {n} weights, got {}", portfolio.weights.len()),
        ));
        shape_ok = false;
    } else {
        if portfolio.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            issues.push(FieldIssue::new(
                "portfolio.weights",
                "weights must be finite and non-negative",
            ));
            shape_ok = false;
        }
        let sum: f64 = portfolio.weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOL {
            issues.push(FieldIssue::new(
                "portfolio.weights",
                format!("weights must sum to 1 within {WEIGHT_SUM_TOL:e}, got {sum}"),
            ));
        }
    }

    if portfolio.volatility.len() != n {
        issues.push(FieldIssue::new(
            "portfolio.volatility",
            format!("expected {n} volatilities, got {}", portfolio.volatility.len()),
        ));
        shape_ok = false;
    } else if portfolio.volatility.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        issues.push(FieldIssue::new(
            "portfolio.volatility",
            "volatilities must be finite and strictly positive",
        ));
        shape_ok = false;
    }

    if !validate_correlation(portfolio, n, issues) {
        shape_ok = false;
    }

    // PSD confirmation only makes sense once the matrix is structurally sound.
    if shape_ok {
        let sigma = kernel::covariance_matrix(portfolio);
        if !kernel::is_psd(&sigma) {
            issues.push(FieldIssue::new(
                "portfolio.correlation_matrix",
                "covariance diag(σ)·R·diag(σ) is not positive semi-definite",
            ));
        }
    }
}

/// Structural checks on the correlation matrix. Returns false when the
/// matrix is too malformed for a PSD check to be meaningful.
fn validate_correlation(portfolio: &Portfolio, n: usize, issues: &mut Vec<FieldIssue>) -> bool {
    let m = &portfolio.correlation_matrix;

    if m.len() != n || m.iter().any(|row| row.len() != n) {
        issues.push(FieldIssue::new(
            "portfolio.correlation_matrix",
            format!("expected a {n}x{n} matrix"),
        ));
        return false;
    }

    let mut sound = true;
    for i in 0..n {
        if (m[i][i] - 1.0).abs() > 1e-12 {
            issues.push(FieldIssue::new(
                "portfolio.correlation_matrix",
                format!("diagonal entry [{i}][{i}] must be 1.0, got {}", m[i][i]),
            ));
            sound = false;
        }
        for j in (i + 1)..n {
            if !m[i][j].is_finite() || m[i][j] < -1.0 || m[i][j] > 1.0 {
                issues.push(FieldIssue::new(
                    "portfolio.correlation_matrix",
                    format!("entry [{i}][{j}] must lie in [-1, 1], got {}", m[i][j]),
                ));
                sound = false;
            }
            if (m[i][j] - m[j][i]).abs() > 1e-12 {
                issues.push(FieldIssue::new(
                    "portfolio.correlation_matrix",
                    format!("matrix must be symmetric: [{i}][{j}] != [{j}][{i}]"),
                ));
                sound = false;
            }
        }
    }
    sound
}

/// Cross-field checks on the perturbation itself. Returns the resolved
/// asset index when the asset exists.
fn validate_perturbation(request: &RunRequest, issues: &mut Vec<FieldIssue>) -> Option<usize> {
    let asset_index = request.portfolio.asset_index(&request.asset);
    if asset_index.is_none() {
        issues.push(FieldIssue::new(
            "asset",
            format!("asset '{}' is not part of the portfolio", request.asset),
        ));
    }

    if request.steps < MIN_STEPS || request.steps > MAX_STEPS {
        issues.push(FieldIssue::new(
            "steps",
            format!("steps must lie in [{MIN_STEPS}, {MAX_STEPS}], got {}", request.steps),
        ));
    }

    let (min, max) = request.range;
    if !min.is_finite() || !max.is_finite() {
        issues.push(FieldIssue::new("range", "range bounds must be finite"));
        return asset_index;
    }
    if min >= max {
        issues.push(FieldIssue::new(
            "range",
            format!("range min must be strictly below max, got [{min}, {max}]"),
        ));
    }

    match request.param {
        PerturbParam::Volatility => {
            if min <= 0.0 {
                issues.push(FieldIssue::new(
                    "range.min",
                    "volatility sweep bounds must be strictly positive",
                ));
            }
        }
        PerturbParam::Weight => {
            if min < 0.0 || max > 1.0 {
                issues.push(FieldIssue::new(
                    "range",
                    "weight sweep bounds must lie in [0, 1]",
                ));
            }
        }
        PerturbParam::Correlation => {
            if min < -1.0 || max > 1.0 {
                issues.push(FieldIssue::new(
                    "range",
                    "correlation sweep bounds must lie in [-1, 1]",
                ));
            }
            if request.portfolio.num_assets() == 1 {
                issues.push(FieldIssue::new(
                    "param",
                    "correlation sweep requires at least two assets",
                ));
            }
        }
    }

    asset_index
}

fn validate_options(request: &RunRequest, issues: &mut Vec<FieldIssue>) {
    if let Some(q) = &request.quantum_options {
        if let Some(qubits) = q.num_qubits {
            if !(1..=5).contains(&qubits) {
                issues.push(FieldIssue::new(
                    "quantum_options.num_qubits",
                    format!("price qubits must lie in [1, 5], got {qubits}"),
                ));
            }
        }
        if let Some(shots) = q.shots {
            if shots == 0 {
                issues.push(FieldIssue::new("quantum_options.shots", "shots must be positive"));
            }
        }
        if let Some(threshold) = q.threshold {
            if !threshold.is_finite() {
                issues.push(FieldIssue::new(
                    "quantum_options.threshold",
                    "threshold must be finite",
                ));
            }
        }
    }

    if let Some(h) = &request.hybrid_options {
        if let Some(anchors) = h.num_anchors {
            if anchors < 2 || anchors > request.steps {
                issues.push(FieldIssue::new(
                    "hybrid_options.num_anchors",
                    format!(
                        "anchor count must lie in [2, steps={}], got {anchors}",
                        request.steps
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HybridOptions, Mode, QuantumOptions};

    fn valid_request() -> RunRequest {
        RunRequest {
            mode: Mode::Classical,
            portfolio: Portfolio {
                assets: vec!["A".into(), "B".into()],
                weights: vec![0.6, 0.4],
                volatility: vec![0.15, 0.25],
                correlation_matrix: vec![vec![1.0, 0.3], vec![0.3, 1.0]],
            },
            param: PerturbParam::Volatility,
            asset: "A".into(),
            range: (0.1, 0.3),
            steps: 5,
            seed: Some(7),
            quantum_options: None,
            hybrid_options: None,
        }
    }

    #[test]
    fn valid_request_passes_and_resolves_asset_index() {
        let validated = validate(&valid_request()).unwrap();
        assert_eq!(validated.spec.asset_index, 0);
        assert_eq!(validated.spec.steps, 5);
    }

    #[test]
    fn all_issues_are_collected_not_just_the_first() {
        let mut req = valid_request();
        req.portfolio.weights = vec![0.9, 0.4]; // bad sum
        req.asset = "ZZZ".into(); // unknown asset
        req.steps = 1; // out of bounds
        req.range = (0.3, 0.1); // inverted

        let err = validate(&req).unwrap_err();
        let fields: Vec<&str> = err.issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"portfolio.weights"));
        assert!(fields.contains(&"asset"));
        assert!(fields.contains(&"steps"));
        assert!(fields.contains(&"range"));
        assert!(err.issues.len() >= 4);
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        let mut req = valid_request();
        req.portfolio.assets = vec!["A".into(), "A".into()];
        let err = validate(&req).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.message.contains("duplicate asset symbol")));
    }

    #[test]
    fn asymmetric_correlation_is_rejected() {
        let mut req = valid_request();
        req.portfolio.correlation_matrix = vec![vec![1.0, 0.3], vec![0.2, 1.0]];
        let err = validate(&req).unwrap_err();
        assert!(err.issues.iter().any(|i| i.message.contains("symmetric")));
    }

    #[test]
    fn non_psd_covariance_is_rejected() {
        let mut req = valid_request();
        req.portfolio.assets = vec!["A".into(), "B".into(), "C".into()];
        req.portfolio.weights = vec![0.4, 0.3, 0.3];
        req.portfolio.volatility = vec![0.2, 0.2, 0.2];
        req.portfolio.correlation_matrix = vec![
            vec![1.0, -0.9, -0.9],
            vec![-0.9, 1.0, -0.9],
            vec![-0.9, -0.9, 1.0],
        ];
        let err = validate(&req).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.message.contains("positive semi-definite")));
    }

    #[test]
    fn volatility_sweep_requires_positive_bounds() {
        let mut req = valid_request();
        req.range = (-0.1, 0.3);
        let err = validate(&req).unwrap_err();
        assert!(err.issues.iter().any(|i| i.field == "range.min"));
    }

    #[test]
    fn correlation_sweep_needs_two_assets() {
        let mut req = valid_request();
        req.portfolio.assets = vec!["A".into()];
        req.portfolio.weights = vec![1.0];
        req.portfolio.volatility = vec![0.2];
        req.portfolio.correlation_matrix = vec![vec![1.0]];
        req.param = PerturbParam::Correlation;
        req.range = (-0.5, 0.5);
        let err = validate(&req).unwrap_err();
        assert!(err.issues.iter().any(|i| i.field == "param"));
    }

    #[test]
    fn full_weight_sweep_on_two_assets_is_allowed() {
        let mut req = valid_request();
        req.param = PerturbParam::Weight;
        req.range = (0.0, 1.0);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn option_blocks_are_checked() {
        let mut req = valid_request();
        req.quantum_options = Some(QuantumOptions {
            num_qubits: Some(9),
            shots: Some(0),
            threshold: Some(f64::NAN),
        });
        req.hybrid_options = Some(HybridOptions { num_anchors: Some(1) });
        let err = validate(&req).unwrap_err();
        let fields: Vec<&str> = err.issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"quantum_options.num_qubits"));
        assert!(fields.contains(&"quantum_options.shots"));
        assert!(fields.contains(&"quantum_options.threshold"));
        assert!(fields.contains(&"hybrid_options.num_anchors"));
    }
}
