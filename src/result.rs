//! Result-side data model: per-step results, the assembled sweep record,
//! and the persisted test run. Non-finite numbers serialize to JSON `null`
//! and deserialize back to NaN, with the flags map carrying the explanation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::AnalyticsBundle;
use crate::kernel;
use crate::model::{Mode, PerturbParam, RunRequest};

/// Serde adapter mapping non-finite floats to JSON `null` and back to NaN.
pub mod nan_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Like `nan_null`, for two-element tuples such as confidence intervals.
pub mod nan_pair {
    use serde::ser::SerializeTuple;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &(f64, f64), serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        for v in [value.0, value.1] {
            if v.is_finite() {
                tuple.serialize_element(&v)?;
            } else {
                tuple.serialize_element(&Option::<f64>::None)?;
            }
        }
        tuple.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(f64, f64), D::Error> {
        let raw = <(Option<f64>, Option<f64>)>::deserialize(deserializer)?;
        Ok((raw.0.unwrap_or(f64::NAN), raw.1.unwrap_or(f64::NAN)))
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Per-step recovery flags. Serialized only when set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFlags {
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_psd: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub quantum_fallback: bool,
}

impl StepFlags {
    pub fn is_empty(&self) -> bool {
        !self.non_psd && !self.quantum_fallback
    }
}

/// One completed sweep step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub perturbed_value: f64,
    #[serde(with = "nan_null")]
    pub portfolio_volatility_daily: f64,
    #[serde(with = "nan_null")]
    pub portfolio_volatility_annualized: f64,
    #[serde(with = "nan_null")]
    pub delta_vs_baseline: f64,
    #[serde(default, skip_serializing_if = "StepFlags::is_empty")]
    pub flags: StepFlags,
}

impl StepResult {
    pub fn new(perturbed_value: f64, sigma_daily: f64, baseline_daily: f64, flags: StepFlags) -> Self {
        Self {
            perturbed_value,
            portfolio_volatility_daily: sigma_daily,
            portfolio_volatility_annualized: kernel::annualize(sigma_daily),
            delta_vs_baseline: sigma_daily - baseline_daily,
            flags,
        }
    }
}

/// The assembled response for one sweep, ordered so that
/// `results[i].perturbed_value == range_tested[i]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub perturbation: PerturbParam,
    pub asset: String,
    pub range_tested: Vec<f64>,
    #[serde(with = "nan_null")]
    pub baseline_portfolio_volatility_daily: f64,
    #[serde(with = "nan_null")]
    pub baseline_portfolio_volatility_annualized: f64,
    pub results: Vec<StepResult>,
}

/// A persisted test run: parameters in, results and analytics out, plus the
/// flags map explaining every local recovery and non-finite field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub test_run_id: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub block_type: Mode,
    pub parameters: RunRequest,
    pub results: SweepResult,
    pub analytics: AnalyticsBundle,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, serde_json::Value>,
}

impl TestRun {
    pub fn cancelled(&self) -> bool {
        matches!(
            self.flags.get("cancelled"),
            Some(serde_json::Value::Bool(true))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrap {
        #[serde(with = "nan_null")]
        value: f64,
        #[serde(with = "nan_pair")]
        pair: (f64, f64),
    }

    #[test]
    fn nan_serializes_to_null_and_back() {
        let w = Wrap {
            value: f64::NAN,
            pair: (1.5, f64::NAN),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"value":null,"pair":[1.5,null]}"#);
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert!(back.value.is_nan());
        assert_eq!(back.pair.0, 1.5);
        assert!(back.pair.1.is_nan());
    }

    #[test]
    fn finite_values_pass_through() {
        let w = Wrap {
            value: 0.25,
            pair: (0.1, 0.2),
        };
        let json = serde_json::to_string(&w).unwrap();
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, 0.25);
        assert_eq!(back.pair, (0.1, 0.2));
    }

    #[test]
    fn step_result_derives_annualization_and_delta() {
        let step = StepResult::new(0.2, 0.02, 0.015, StepFlags::default());
        assert!((step.portfolio_volatility_annualized - 0.02 * 252f64.sqrt()).abs() < 1e-12);
        assert!((step.delta_vs_baseline - 0.005).abs() < 1e-12);
    }

    #[test]
    fn nan_step_keeps_nan_delta() {
        let step = StepResult::new(
            0.2,
            f64::NAN,
            0.015,
            StepFlags {
                non_psd: true,
                quantum_fallback: false,
            },
        );
        assert!(step.portfolio_volatility_daily.is_nan());
        assert!(step.delta_vs_baseline.is_nan());
        let json = serde_json::to_value(step).unwrap();
        assert_eq!(json["portfolio_volatility_daily"], serde_json::Value::Null);
        assert_eq!(json["flags"]["non_psd"], serde_json::json!(true));
    }

    #[test]
    fn empty_step_flags_are_omitted() {
        let step = StepResult::new(0.2, 0.02, 0.015, StepFlags::default());
        let json = serde_json::to_value(step).unwrap();
        assert!(json.get("flags").is_none());
    }
}
