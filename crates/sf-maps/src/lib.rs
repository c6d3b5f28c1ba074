//! # sf-maps
//!
//! The addressing scheme shared by every Skyfit dataset: a spatial pixel
//! grid crossed with an energy axis. Provides sky coordinates, validated
//! energy axes (reconstructed and true), pixel-aligned cutouts with the
//! slice bookkeeping stacking needs, and plane-wise image convolution.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Energy axes with ordered bin edges.
pub mod axis;
/// 2-D image convolution and kernel constructors.
pub mod convolve;
/// Sky coordinates and map geometry.
pub mod geom;

pub use axis::EnergyAxis;
pub use geom::{CutoutSlices, MapGeom, SkyCoord};
