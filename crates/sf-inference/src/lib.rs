//! # sf-inference
//!
//! The fitting side of Skyfit: the joint Poisson likelihood fit over one or
//! more map datasets, covariance and identifiability reporting, the
//! flux-points estimator (profile-likelihood errors, upper limits, TS) and
//! the convolution-based excess/significance map estimator.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Excess and significance maps.
pub mod excess_map;
/// The joint likelihood fit engine.
pub mod fit;
/// Spectral flux-point estimation.
pub mod flux_points;

pub use excess_map::{ExcessMapEstimator, ExcessMaps};
pub use fit::{Fit, ParameterSpace};
pub use flux_points::{FluxPoint, FluxPoints, FluxPointsEstimator};
