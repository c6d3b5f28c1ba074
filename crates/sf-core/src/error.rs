//! Error types for Skyfit

use thiserror::Error;

/// Skyfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// Observation and requested geometry footprint do not overlap.
    ///
    /// Per-observation and recoverable: the reduction loop skips the
    /// observation and continues.
    #[error("coverage error: {0}")]
    Coverage(String),

    /// A fit has too few usable data points, or the problem is degenerate
    /// (e.g. zero background in every usable bin).
    #[error("under-constrained fit: {0}")]
    Underconstrained(String),

    /// Model rejected before fitting: initial value outside bounds,
    /// missing or duplicated component, inconsistent parameter link.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Optimizer exhausted its iteration/evaluation budget.
    #[error("optimizer did not converge: {0}")]
    NonConvergence(String),

    /// Validation error (inconsistent shapes, unknown names, bad configuration)
    #[error("validation error: {0}")]
    Validation(String),

    /// Computation error (non-finite intermediate values and the like)
    #[error("computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
