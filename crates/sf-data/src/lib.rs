//! # sf-data
//!
//! The data-reduction side of Skyfit: per-observation instrument records,
//! reduction onto a reference geometry, safe-range filtering, field-of-view
//! background normalization, and the append-only stacking fold that merges
//! reduced observations into one dataset for joint fitting.
//!
//! Reduction is embarrassingly parallel across observations; only the
//! stacking fold serializes.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Map datasets and the stacking fold.
pub mod dataset;
/// Predicted-counts evaluation (model folding).
pub mod evaluator;
/// Field-of-view background normalization.
pub mod fov_bkg;
/// In-memory instrument response functions.
pub mod irf;
/// Per-observation reduction.
pub mod maker;
/// Observation records.
pub mod obs;
/// Safe-range filtering.
pub mod safemask;

pub use dataset::{Datasets, MapDataset};
pub use evaluator::NpredEvaluator;
pub use fov_bkg::{BackgroundMethod, FallbackPolicy, FovBackgroundFit, FovBackgroundMaker};
pub use irf::{BackgroundRateModel, EdispKernel, EffectiveArea, EnergyDispersion, PsfKernel, PsfModel};
pub use maker::{MapDatasetMaker, Quantity};
pub use obs::{Event, GoodTimeInterval, Observation};
pub use safemask::{SafeMaskCriterion, SafeMaskMaker};
