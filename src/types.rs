/// Core error taxonomy and shared result type for the tradebench harness
use thiserror::Error;

/// Default relative tolerance for numeric log comparison (Determ, Anti-Leak
/// and Audit gates).
pub const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Harness error taxonomy.
///
/// Gate failures are values (`GateResult`), not errors; these variants are
/// reserved for harness-infrastructure faults and for the fatal taxonomy
/// surfaced in evidence bundles.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("determinism error: {0}")]
    Determinism(String),

    #[error("leakage error: {0}")]
    Leakage(String),

    #[error("audit mismatch: {0}")]
    AuditMismatch(String),

    #[error("semantic drift: {0}")]
    Drift(String),

    #[error("evidence store error: {0}")]
    Store(String),
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Relative comparison with an absolute floor of 1.0, so values near zero
/// are compared absolutely at the same tolerance.
pub fn nearly_equal(a: f64, b: f64, rel_tol: f64) -> bool {
    if a == b {
        return true;
    }
    if !a.is_finite() || !b.is_finite() {
        // NaN vs NaN counts as equal for log comparison; NaN vs number does not.
        return a.is_nan() && b.is_nan();
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= rel_tol * scale
}
