//! KANOSYM core: a portfolio-sensitivity evaluation engine. Given a small
//! multi-asset portfolio and a parameter-perturbation plan, it produces a
//! deterministic, annotated curve of portfolio risk as one scalar parameter
//! sweeps across a range, in one of three evaluation modes (classical
//! Monte-Carlo, quantum amplitude estimation on a simulator, or a hybrid
//! GP-corrected combination), plus the analytics bundle describing the run.

pub mod analytics;
pub mod cancel;
pub mod classical;
pub mod config;
pub mod engine;
pub mod error;
pub mod gp;
pub mod hybrid;
pub mod kernel;
pub mod model;
pub mod quantum;
pub mod result;
pub mod store;
pub mod sweep;
pub mod validate;

pub use cancel::{CancelToken, RunContext};
pub use engine::{run, run_with_observer};
pub use error::{EngineError, StoreError, ValidationError};
pub use model::{Mode, PerturbParam, Portfolio, RunRequest};
pub use result::{StepResult, SweepResult, TestRun};
pub use store::{JsonFileStore, ProjectRecord, ProjectStore, TestRunStore};
