//! Safe-range filtering.
//!
//! Each criterion produces an independent boolean cube from the dataset and
//! its source observation; the safe mask is their AND. Criteria are pure,
//! so tightening any single threshold can only remove bins, never add them.

use ndarray::{s, Array3};
use sf_core::{Error, Result};

use crate::dataset::MapDataset;
use crate::obs::Observation;

/// A single safe-range criterion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafeMaskCriterion {
    /// Maximum offset from the pointing (deg).
    OffsetMax(f64),
    /// Low-energy threshold: reconstructed bins where the on-axis effective
    /// area falls below this fraction of its peak are unsafe.
    AeffMax(f64),
    /// Low-energy threshold at the peak of the background spectrum.
    BkgPeak,
}

impl SafeMaskCriterion {
    /// Parse a criterion from its configuration name and value.
    pub fn parse(name: &str, value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "criterion '{name}': non-finite value {value}"
            )));
        }
        match name {
            "offset-max" => {
                if value <= 0.0 {
                    return Err(Error::Validation(format!(
                        "offset-max must be positive, got {value}"
                    )));
                }
                Ok(Self::OffsetMax(value))
            }
            "aeff-max" => {
                if !(value > 0.0 && value < 1.0) {
                    return Err(Error::Validation(format!(
                        "aeff-max must lie in (0, 1), got {value}"
                    )));
                }
                Ok(Self::AeffMax(value))
            }
            "bkg-peak" => Ok(Self::BkgPeak),
            other => Err(Error::Validation(format!("unknown safe-mask criterion '{other}'"))),
        }
    }

    /// Evaluate the criterion mask.
    fn evaluate(&self, dataset: &MapDataset, obs: &Observation) -> Array3<bool> {
        let shape = dataset.geom.cube_shape();
        match *self {
            Self::OffsetMax(max_deg) => {
                let sep = dataset.geom.separation_map(&obs.pointing);
                let mut mask = Array3::from_elem(shape, false);
                for mut plane in mask.outer_iter_mut() {
                    ndarray::Zip::from(&mut plane)
                        .and(&sep)
                        .for_each(|m, &d| *m = d <= max_deg);
                }
                mask
            }
            Self::AeffMax(fraction) => {
                let curve = obs.aeff.on_axis_curve(dataset.geom.axis());
                let peak = curve.iter().cloned().fold(0.0, f64::max);
                let mut mask = Array3::from_elem(shape, true);
                for (k, &aeff) in curve.iter().enumerate() {
                    if aeff < fraction * peak {
                        mask.slice_mut(s![k, .., ..]).fill(false);
                    }
                }
                mask
            }
            Self::BkgPeak => {
                // Background spectrum summed over the map; bins below its
                // peak are unsafe.
                let spectrum: Vec<f64> = dataset
                    .background
                    .outer_iter()
                    .map(|plane| plane.sum())
                    .collect();
                let peak = spectrum
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(k, _)| k)
                    .unwrap_or(0);
                let mut mask = Array3::from_elem(shape, true);
                for k in 0..peak {
                    mask.slice_mut(s![k, .., ..]).fill(false);
                }
                mask
            }
        }
    }
}

/// Applies a set of safe-range criteria to a dataset.
#[derive(Debug, Clone)]
pub struct SafeMaskMaker {
    criteria: Vec<SafeMaskCriterion>,
}

impl SafeMaskMaker {
    /// Maker applying the given criteria.
    pub fn new(criteria: Vec<SafeMaskCriterion>) -> Self {
        Self { criteria }
    }

    /// AND of all criterion masks.
    pub fn run(&self, dataset: &MapDataset, obs: &Observation) -> Array3<bool> {
        let mut mask = Array3::from_elem(dataset.geom.cube_shape(), true);
        for criterion in &self.criteria {
            let part = criterion.evaluate(dataset, obs);
            ndarray::Zip::from(&mut mask).and(&part).for_each(|m, &p| *m = *m && p);
        }
        mask
    }

    /// Intersect the dataset's safe mask with the criterion masks in place.
    pub fn apply(&self, dataset: &mut MapDataset, obs: &Observation) {
        let mask = self.run(dataset, obs);
        ndarray::Zip::from(&mut dataset.mask_safe)
            .and(&mask)
            .for_each(|m, &p| *m = *m && p);
    }
}
