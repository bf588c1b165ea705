//! Engine-wide constants. These are compile-time policy, not request options.

/// Trading days per year used for volatility annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Number of Monte Carlo samples drawn per evaluated point in classical mode.
/// Fixed per run; changing it is a recompile, not a request option.
pub const MC_SAMPLES: usize = 10_000;

/// Samples drawn between cancellation polls in the classical estimator.
pub const MC_BATCH_SIZE: usize = 1_024;

/// Relative tolerance for the running-volatility convergence windows.
pub const MC_CONVERGENCE_TOL: f64 = 0.05;

/// Tolerance on |Σ weights − 1| accepted by the validator.
pub const WEIGHT_SUM_TOL: f64 = 1e-6;

/// Smallest eigenvalue still treated as zero when checking positive
/// semi-definiteness of a covariance matrix.
pub const PSD_EIGEN_TOL: f64 = -1e-10;

/// Default number of price qubits discretizing the return distribution.
pub const DEFAULT_PRICE_QUBITS: usize = 3;

/// Number of evaluation qubits granting amplitude-estimation precision.
/// Total qubits at defaults: DEFAULT_PRICE_QUBITS + EVAL_QUBITS = 6.
pub const EVAL_QUBITS: usize = 3;

/// Default measurement shots per Grover-power level.
pub const DEFAULT_SHOTS: u64 = 1_024;

/// Default return threshold encoded by the quantum estimator. A zero
/// threshold carries no volatility information, so the estimator shifts to a
/// non-central tail at minus one classical sigma (and flags the surrogate).
pub const DEFAULT_THRESHOLD: f64 = 0.0;

/// Half-width of the discretization grid in units of portfolio sigma.
pub const GRID_WIDTH_SIGMAS: f64 = 3.0;

/// Resolution of the maximum-likelihood search over the amplitude angle.
pub const MLE_GRID_POINTS: usize = 10_000;

/// Default number of quantum anchor points in hybrid mode.
pub const DEFAULT_NUM_ANCHORS: usize = 3;

/// Anchor residuals larger than this daily-sigma threshold count as
/// significant quantum corrections in the hybrid diagnostics.
pub const CORRECTION_SIGNIFICANCE: f64 = 1e-3;

/// Initial diagonal jitter for the GP Gram matrix, escalated tenfold per
/// retry up to GP_JITTER_MAX before falling back to linear interpolation.
pub const GP_JITTER_INITIAL: f64 = 1e-10;
pub const GP_JITTER_MAX: f64 = 1e-4;

/// Soft wall-clock deadline for a single run, in seconds. Cooperative: the
/// engine fires the cancellation token when it notices the deadline passed.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Bounds accepted for the perturbation step count.
pub const MIN_STEPS: usize = 2;
pub const MAX_STEPS: usize = 20;

/// Largest portfolio the engine accepts.
pub const MAX_ASSETS: usize = 5;

/// Schema version stamped on every persisted record.
pub const SCHEMA_VERSION: u32 = 1;
