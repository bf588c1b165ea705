use std::fmt;
use thiserror::Error;

/// One rejected field of a run request. `field` uses dotted-path notation
/// (`portfolio.weights`, `range.min`) so callers can address the offending
/// input directly.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validation failure carrying every offending field, not just the first.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<FieldIssue>) -> Self {
        Self { issues }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request validation failed ({} issue(s)):", self.issues.len())?;
        for issue in &self.issues {
            write!(f, " [{}] {};", issue.field, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Persistence-layer failures. Always surfaced to the caller, never
/// swallowed by the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} '{key}' already exists")]
    Duplicate { kind: &'static str, key: String },

    #[error("record schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Run-level failures. Locally-recovered conditions (non-PSD points,
/// simulator fallbacks, GP degradation, cancellation) are not errors; they
/// surface only through the flags map on the test run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = ValidationError::new(vec![
            FieldIssue::new("portfolio.weights", "must sum to 1"),
            FieldIssue::new("steps", "must be between 2 and 20"),
        ]);
        let text = err.to_string();
        assert!(text.contains("2 issue(s)"));
        assert!(text.contains("portfolio.weights"));
        assert!(text.contains("steps"));
    }

    #[test]
    fn store_error_display_names_the_key() {
        let err = StoreError::NotFound {
            kind: "project",
            key: "alpha".into(),
        };
        assert_eq!(err.to_string(), "project 'alpha' not found");
    }
}
