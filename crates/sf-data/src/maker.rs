//! Per-observation reduction.
//!
//! `MapDatasetMaker` projects one observation onto a reference geometry:
//! events are binned into counts, responses are evaluated per pixel into
//! exposure and background templates, and the PSF/energy-migration kernels
//! are reduced onto the local grids. Reduction is pure per observation, so
//! the batch driver fans out over rayon.

use ndarray::Array3;
use rayon::prelude::*;
use sf_core::{Error, Result};
use sf_maps::{EnergyAxis, MapGeom};

use crate::dataset::MapDataset;
use crate::irf::M2_TO_CM2;
use crate::obs::Observation;

/// Data products a reduction can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Binned event counts.
    Counts,
    /// Exposure cube (cm² s) on the true-energy axis.
    Exposure,
    /// Residual-background template (counts).
    Background,
    /// Reduced PSF kernel.
    Psf,
    /// Reduced energy-migration kernel.
    Edisp,
}

/// Default PSF kernel truncation radius (deg).
const DEFAULT_PSF_RADIUS_DEG: f64 = 0.5;

/// Reduces observations onto a reference geometry.
#[derive(Debug, Clone)]
pub struct MapDatasetMaker {
    selection: Vec<Quantity>,
    psf_radius_deg: f64,
}

impl MapDatasetMaker {
    /// Maker producing the selected quantities.
    pub fn new(selection: &[Quantity]) -> Self {
        Self { selection: selection.to_vec(), psf_radius_deg: DEFAULT_PSF_RADIUS_DEG }
    }

    /// Maker producing every quantity.
    pub fn all() -> Self {
        Self::new(&[
            Quantity::Counts,
            Quantity::Exposure,
            Quantity::Background,
            Quantity::Psf,
            Quantity::Edisp,
        ])
    }

    /// Builder: PSF kernel truncation radius in degrees.
    pub fn with_psf_radius(mut self, radius_deg: f64) -> Self {
        self.psf_radius_deg = radius_deg;
        self
    }

    fn selected(&self, q: Quantity) -> bool {
        self.selection.contains(&q)
    }

    /// Reduce one observation onto `geom`.
    ///
    /// Fails with a coverage error when the observation field of view does
    /// not intersect the map footprint; batch callers skip and log those.
    pub fn run(
        &self,
        geom: &MapGeom,
        energy_true: &EnergyAxis,
        obs: &Observation,
    ) -> Result<MapDataset> {
        let distance = obs.pointing.separation(&geom.center());
        if distance > obs.fov_radius_deg() + geom.half_width_deg() {
            return Err(Error::Coverage(format!(
                "observation {} points {:.2} deg from the map center, \
                 outside the usable field of view",
                obs.id, distance
            )));
        }

        let mut dataset =
            MapDataset::empty(&format!("obs-{}", obs.id), geom.clone(), energy_true.clone())?;
        let livetime = obs.livetime_s();

        if self.selected(Quantity::Counts) {
            self.fill_counts(&mut dataset, obs);
        }
        if self.selected(Quantity::Exposure) {
            self.fill_exposure(&mut dataset, obs, livetime);
        }
        if self.selected(Quantity::Background) {
            self.fill_background(&mut dataset, obs, livetime);
        }
        if self.selected(Quantity::Psf) {
            dataset.psf =
                Some(obs.psf.kernel(geom.binsz_deg(), energy_true, self.psf_radius_deg)?);
        }
        if self.selected(Quantity::Edisp) {
            dataset.edisp = Some(obs.edisp.kernel(energy_true, geom.axis())?);
        }

        self.init_mask(&mut dataset, obs);
        Ok(dataset)
    }

    /// Reduce a batch of observations in parallel. Coverage failures are
    /// logged and skipped; any other error aborts the batch.
    pub fn run_batch(
        &self,
        geom: &MapGeom,
        energy_true: &EnergyAxis,
        observations: &[Observation],
    ) -> Result<Vec<MapDataset>> {
        let results: Vec<(u32, Result<MapDataset>)> = observations
            .par_iter()
            .map(|obs| (obs.id, self.run(geom, energy_true, obs)))
            .collect();

        let mut datasets = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(ds) => datasets.push(ds),
                Err(Error::Coverage(msg)) => {
                    log::warn!("skipping observation {id}: {msg}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(datasets)
    }

    fn fill_counts(&self, dataset: &mut MapDataset, obs: &Observation) {
        let geom = dataset.geom.clone();
        for event in &obs.events {
            let Some(k) = geom.axis().bin_index(event.energy_tev) else { continue };
            let Some((iy, ix)) = geom.pix_index(&event.coord) else { continue };
            dataset.counts[(k, iy, ix)] += 1;
        }
    }

    fn fill_exposure(&self, dataset: &mut MapDataset, obs: &Observation, livetime: f64) {
        let geom = dataset.geom.clone();
        let centers = dataset.energy_true.centers();
        let (n_true, ny, nx) = dataset.exposure.dim();
        let mut exposure = Array3::<f64>::zeros((n_true, ny, nx));
        for iy in 0..ny {
            for ix in 0..nx {
                let coord = geom.pix_to_coord(ix as f64, iy as f64);
                let offset = obs.offset_deg(&coord);
                for (t, &e_t) in centers.iter().enumerate() {
                    exposure[(t, iy, ix)] =
                        obs.aeff.value(offset, e_t) * M2_TO_CM2 * livetime;
                }
            }
        }
        dataset.exposure = exposure;
    }

    fn fill_background(&self, dataset: &mut MapDataset, obs: &Observation, livetime: f64) {
        let geom = dataset.geom.clone();
        let solid_angle = geom.solid_angle();
        let axis = geom.axis().clone();
        let centers = axis.centers();
        let (n_reco, ny, nx) = dataset.background.dim();
        let mut background = Array3::<f64>::zeros((n_reco, ny, nx));
        for iy in 0..ny {
            for ix in 0..nx {
                let coord = geom.pix_to_coord(ix as f64, iy as f64);
                let offset = obs.offset_deg(&coord);
                for (k, &e_k) in centers.iter().enumerate() {
                    background[(k, iy, ix)] =
                        obs.bkg.value(offset, e_k) * livetime * solid_angle * axis.width(k);
                }
            }
        }
        dataset.background = background;
    }

    /// Initial safe mask: pixels inside the field of view. The safe-range
    /// maker refines this per criterion afterwards.
    fn init_mask(&self, dataset: &mut MapDataset, obs: &Observation) {
        let geom = dataset.geom.clone();
        let fov = obs.fov_radius_deg();
        let (n_reco, ny, nx) = dataset.mask_safe.dim();
        for iy in 0..ny {
            for ix in 0..nx {
                let coord = geom.pix_to_coord(ix as f64, iy as f64);
                let inside = obs.offset_deg(&coord) <= fov;
                for k in 0..n_reco {
                    dataset.mask_safe[(k, iy, ix)] = inside;
                }
            }
        }
    }
}
