//! # sf-core
//!
//! Shared foundations for Skyfit: the error taxonomy, fit result types,
//! Poisson fit-statistic helpers, and the bounded L-BFGS optimizer wrapper.
//!
//! Higher-level crates (`sf-data`, `sf-inference`) depend on these
//! abstractions rather than on each other's internals.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy and `Result` alias.
pub mod error;
/// Bounded quasi-Newton optimizer (argmin L-BFGS wrapper).
pub mod optimizer;
/// Poisson fit statistics (Cash) and closed-form significance.
pub mod stats;
/// Result types shared across the workspace.
pub mod types;

pub use error::{Error, Result};
pub use optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use types::FitResult;
