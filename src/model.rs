//! Request-side data model: the portfolio under test, the perturbation to
//! sweep, and the full run request as received from external collaborators.

use serde::{Deserialize, Serialize};

/// Evaluation mode selecting the volatility estimator for the sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Classical,
    Quantum,
    Hybrid,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Classical => "classical",
            Mode::Quantum => "quantum",
            Mode::Hybrid => "hybrid",
        }
    }
}

/// Which scalar of the portfolio the sweep perturbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerturbParam {
    Volatility,
    Weight,
    Correlation,
}

impl PerturbParam {
    pub fn as_str(self) -> &'static str {
        match self {
            PerturbParam::Volatility => "volatility",
            PerturbParam::Weight => "weight",
            PerturbParam::Correlation => "correlation",
        }
    }
}

/// A small multi-asset portfolio. Immutable once validated; sweeps operate
/// on derived copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub assets: Vec<String>,
    pub weights: Vec<f64>,
    pub volatility: Vec<f64>,
    pub correlation_matrix: Vec<Vec<f64>>,
}

impl Portfolio {
    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn asset_index(&self, symbol: &str) -> Option<usize> {
        self.assets.iter().position(|s| s == symbol)
    }
}

/// Quantum estimator knobs carried by the request. Absent fields fall back
/// to crate defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantumOptions {
    /// Price qubits discretizing the return distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_qubits: Option<usize>,
    /// Measurement shots per Grover-power level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shots: Option<u64>,
    /// Return threshold whose tail probability is amplitude-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Hybrid estimator knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_anchors: Option<usize>,
}

/// A complete run request as submitted by external collaborators. Validation
/// turns this into a `ValidatedRequest` before any numerics run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub mode: Mode,
    pub portfolio: Portfolio,
    pub param: PerturbParam,
    pub asset: String,
    /// (min, max) of the swept scalar; serialized as a two-element array.
    pub range: (f64, f64),
    pub steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantum_options: Option<QuantumOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid_options: Option<HybridOptions>,
}

/// The perturbation plan extracted from a validated request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbSpec {
    pub param: PerturbParam,
    pub asset: String,
    /// Index of `asset` within the portfolio, resolved by the validator.
    pub asset_index: usize,
    pub range: (f64, f64),
    pub steps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_asset_request() -> RunRequest {
        RunRequest {
            mode: Mode::Classical,
            portfolio: Portfolio {
                assets: vec!["A".into(), "B".into()],
                weights: vec![0.5, 0.5],
                volatility: vec![0.1, 0.3],
                correlation_matrix: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            },
            param: PerturbParam::Weight,
            asset: "A".into(),
            range: (0.0, 1.0),
            steps: 5,
            seed: Some(0),
            quantum_options: None,
            hybrid_options: None,
        }
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = two_asset_request();
        let json = serde_json::to_string(&req).unwrap();
        let back: RunRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn mode_and_param_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Quantum).unwrap(), "\"quantum\"");
        assert_eq!(
            serde_json::to_string(&PerturbParam::Correlation).unwrap(),
            "\"correlation\""
        );
    }

    #[test]
    fn range_serializes_as_array() {
        let req = two_asset_request();
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["range"], serde_json::json!([0.0, 1.0]));
    }

    #[test]
    fn omitted_options_deserialize_to_none() {
        let json = r#"{
            "mode": "classical",
            "portfolio": {
                "assets": ["A"],
                "weights": [1.0],
                "volatility": [0.2],
                "correlation_matrix": [[1.0]]
            },
            "param": "volatility",
            "asset": "A",
            "range": [0.1, 0.3],
            "steps": 3
        }"#;
        let req: RunRequest = serde_json::from_str(json).unwrap();
        assert!(req.seed.is_none());
        assert!(req.quantum_options.is_none());
        assert!(req.hybrid_options.is_none());
    }
}
