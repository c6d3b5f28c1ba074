//! # sf-model
//!
//! Parametric model components for Skyfit: spectral shapes, spatial
//! morphologies, their composition into sky models, the field-of-view
//! background correction model, and the `Models` collection a dataset owns.
//!
//! Every component exposes a describable parameter set (name, value,
//! bounds, frozen flag, optional link key); the fit engine flattens free
//! parameters across components into an order-stable vector.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// The `Models` collection owned by a dataset.
pub mod models;
/// Parameters: value, bounds, frozen flag, link key.
pub mod params;
/// Sky model composition and the FoV background model.
pub mod sky;
/// Spatial morphologies (point, Gaussian, disk).
pub mod spatial;
/// Spectral shapes (power law, exponential-cutoff power law).
pub mod spectral;

pub use models::{Model, Models};
pub use params::Parameter;
pub use sky::{FovBackgroundModel, SkyModel};
pub use spatial::SpatialModel;
pub use spectral::SpectralModel;
