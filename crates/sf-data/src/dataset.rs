//! Map datasets and the stacking fold.
//!
//! A `MapDataset` owns the binned data products of one (or several stacked)
//! observations on a common geometry: counts, exposure, background template,
//! reduced response kernels, masks, and the attached model collection.
//!
//! Stacking is an append-only fold: counts, background and exposure add
//! elementwise on the geometric overlap, kernels combine by
//! exposure-weighted averaging, and safe masks OR together restricted to
//! pixels that actually accumulated exposure. The fold is associative and
//! commutative up to floating-point roundoff, so partial stacks may be
//! merged pairwise.

use ndarray::{s, Array2, Array3, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use sf_core::stats::cash;
use sf_core::{Error, Result};
use sf_maps::{EnergyAxis, MapGeom};
use sf_model::Models;
use std::ops::Range;

use crate::evaluator::NpredEvaluator;
use crate::irf::{EdispKernel, PsfKernel};

/// Binned data products of one or more observations on a common geometry.
#[derive(Debug, Clone)]
pub struct MapDataset {
    /// Dataset name, unique within a `Datasets` collection.
    pub name: String,
    /// Reconstructed-energy geometry addressing counts/background.
    pub geom: MapGeom,
    /// True-energy axis addressing exposure and response kernels.
    pub energy_true: EnergyAxis,
    /// Observed counts, shape (n_reco, ny, nx).
    pub counts: Array3<u64>,
    /// Exposure in cm² s, shape (n_true, ny, nx).
    pub exposure: Array3<f64>,
    /// Background template in counts, shape (n_reco, ny, nx).
    pub background: Array3<f64>,
    /// Reduced PSF kernel, if the reduction selected it.
    pub psf: Option<PsfKernel>,
    /// Reduced energy-migration kernel, if the reduction selected it.
    pub edisp: Option<EdispKernel>,
    /// Safe-range mask, shape (n_reco, ny, nx).
    pub mask_safe: Array3<bool>,
    /// Optional analysis mask, same shape, set by the caller.
    pub mask_fit: Option<Array3<bool>>,
    /// Attached model components.
    pub models: Models,
}

impl MapDataset {
    /// Empty dataset on the given geometry. The true-energy axis must span
    /// the reconstructed axis, otherwise folded predictions would miss
    /// migration into the edge bins.
    pub fn empty(name: &str, geom: MapGeom, energy_true: EnergyAxis) -> Result<Self> {
        if !energy_true.spans(geom.axis()) {
            return Err(Error::Validation(format!(
                "true-energy axis {:?} does not span the reconstructed axis {:?}",
                energy_true.bounds(),
                geom.axis().bounds()
            )));
        }
        let (n_reco, ny, nx) = geom.cube_shape();
        Ok(Self {
            name: name.to_string(),
            counts: Array3::zeros((n_reco, ny, nx)),
            exposure: Array3::zeros((energy_true.n_bins(), ny, nx)),
            background: Array3::zeros((n_reco, ny, nx)),
            psf: None,
            edisp: None,
            mask_safe: Array3::from_elem((n_reco, ny, nx), false),
            mask_fit: None,
            models: Models::new(),
            geom,
            energy_true,
        })
    }

    /// Combined analysis mask: safe ∧ fit (fit defaults to all-true).
    pub fn mask(&self) -> Array3<bool> {
        match &self.mask_fit {
            Some(fit) => {
                let mut out = self.mask_safe.clone();
                Zip::from(&mut out).and(fit).for_each(|m, &f| *m = *m && f);
                out
            }
            None => self.mask_safe.clone(),
        }
    }

    /// Predicted counts for the currently attached models.
    ///
    /// Convenience entry point building a throwaway evaluator; the fit
    /// engine keeps a persistent [`NpredEvaluator`] to reuse convolved
    /// templates across iterations.
    pub fn npred(&self) -> Result<Array3<f64>> {
        NpredEvaluator::new().npred(self)
    }

    /// Cash statistic of the dataset under the attached models, summed over
    /// masked bins.
    pub fn stat(&self) -> Result<f64> {
        let npred = self.npred()?;
        Ok(self.stat_for(&npred))
    }

    /// Cash statistic against a precomputed prediction cube.
    pub fn stat_for(&self, npred: &Array3<f64>) -> f64 {
        let mask = self.mask();
        let mut acc = 0.0;
        Zip::from(&self.counts).and(npred).and(&mask).for_each(|&n, &mu, &m| {
            if m {
                acc += cash(n as f64, mu);
            }
        });
        acc
    }

    /// Replace counts by a Poisson realization of the current prediction.
    /// Deterministic per seed.
    pub fn fake(&mut self, seed: u64) -> Result<()> {
        let npred = self.npred()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counts = Array3::zeros(self.counts.raw_dim());
        for (out, &mu) in counts.iter_mut().zip(npred.iter()) {
            if mu <= 0.0 {
                continue;
            }
            let pois = Poisson::new(mu).map_err(|e| {
                Error::Computation(format!("invalid Poisson mean {mu}: {e}"))
            })?;
            *out = pois.sample(&mut rng) as u64;
        }
        self.counts = counts;
        Ok(())
    }

    /// Replace counts by the rounded prediction (the Asimov dataset of the
    /// current models).
    pub fn set_counts_asimov(&mut self) -> Result<()> {
        let npred = self.npred()?;
        self.counts = npred.mapv(|mu| mu.round().max(0.0) as u64);
        Ok(())
    }

    /// Spatially averaged exposure, the weight used when averaging kernels.
    fn mean_exposure(&self) -> f64 {
        let n = self.exposure.len();
        if n == 0 {
            return 0.0;
        }
        self.exposure.sum() / n as f64
    }

    /// Fold `other` into this dataset.
    ///
    /// Both datasets must share the pixel lattice and both energy axes.
    /// Data add on the footprint overlap; stacking a disjoint or all-zero
    /// dataset leaves this one unchanged (identity).
    pub fn stack(&mut self, other: &MapDataset) -> Result<()> {
        if !self.geom.axis().approx_eq(other.geom.axis()) {
            return Err(Error::Validation(format!(
                "cannot stack '{}' into '{}': reconstructed-energy axes differ",
                other.name, self.name
            )));
        }
        if !self.energy_true.approx_eq(&other.energy_true) {
            return Err(Error::Validation(format!(
                "cannot stack '{}' into '{}': true-energy axes differ",
                other.name, self.name
            )));
        }

        let w_self = self.mean_exposure();
        let w_other = other.mean_exposure();

        if let Some((here, there)) = self.geom.overlap(&other.geom)? {
            let hy = here.y.clone();
            let hx = here.x.clone();
            let ty = there.y.clone();
            let tx = there.x.clone();

            {
                let src = other.counts.slice(s![.., ty.clone(), tx.clone()]);
                let mut dst = self.counts.slice_mut(s![.., hy.clone(), hx.clone()]);
                dst += &src;
            }
            {
                let src = other.background.slice(s![.., ty.clone(), tx.clone()]);
                let mut dst = self.background.slice_mut(s![.., hy.clone(), hx.clone()]);
                dst += &src;
            }
            {
                let src = other.exposure.slice(s![.., ty.clone(), tx.clone()]);
                let mut dst = self.exposure.slice_mut(s![.., hy.clone(), hx.clone()]);
                dst += &src;
            }
            {
                let src = other.mask_safe.slice(s![.., ty, tx]);
                let mut dst = self.mask_safe.slice_mut(s![.., hy, hx]);
                Zip::from(&mut dst).and(&src).for_each(|m, &o| *m = *m || o);
            }
        } else {
            log::warn!(
                "stacking '{}' into '{}': footprints are disjoint, data unchanged",
                other.name,
                self.name
            );
        }

        // Kernels average over the whole stack, weighted by the exposure
        // each side contributed.
        if let Some(other_psf) = &other.psf {
            self.psf = Some(match &self.psf {
                Some(own) => own.weighted_mean(other_psf, w_self, w_other)?,
                None => other_psf.clone(),
            });
        }
        if let Some(other_edisp) = &other.edisp {
            self.edisp = Some(match &self.edisp {
                Some(own) => own.weighted_mean(other_edisp, w_self, w_other)?,
                None => other_edisp.clone(),
            });
        }

        self.restrict_mask_to_exposure();
        Ok(())
    }

    /// Drop safe-mask pixels that never accumulated exposure.
    fn restrict_mask_to_exposure(&mut self) {
        let (_, ny, nx) = self.geom.cube_shape();
        let mut exposed = Array2::from_elem((ny, nx), false);
        for plane in self.exposure.outer_iter() {
            Zip::from(&mut exposed).and(&plane).for_each(|e, &v| *e = *e || v > 0.0);
        }
        for mut plane in self.mask_safe.outer_iter_mut() {
            Zip::from(&mut plane).and(&exposed).for_each(|m, &e| *m = *m && e);
        }
    }

    /// Dataset restricted to a contiguous reconstructed-energy bin range.
    ///
    /// Exposure and the true-energy axis are kept whole; only the
    /// reconstructed side (counts, background, masks, migration kernel) is
    /// sliced. Used by the flux-points estimator.
    pub fn slice_energy(&self, range: Range<usize>) -> Result<MapDataset> {
        let axis = self.geom.axis().slice(range.clone())?;
        let geom = self.geom.with_axis(axis);
        let edisp = match &self.edisp {
            Some(k) => Some(k.slice_reco(range.clone())?),
            None => None,
        };
        Ok(MapDataset {
            name: self.name.clone(),
            geom,
            energy_true: self.energy_true.clone(),
            counts: self.counts.slice(s![range.clone(), .., ..]).to_owned(),
            exposure: self.exposure.clone(),
            background: self.background.slice(s![range.clone(), .., ..]).to_owned(),
            psf: self.psf.clone(),
            edisp,
            mask_safe: self.mask_safe.slice(s![range.clone(), .., ..]).to_owned(),
            mask_fit: self
                .mask_fit
                .as_ref()
                .map(|m| m.slice(s![range.clone(), .., ..]).to_owned()),
            models: self.models.clone(),
        })
    }
}

/// Ordered collection of datasets with unique names, jointly fitted.
#[derive(Debug, Clone, Default)]
pub struct Datasets {
    entries: Vec<MapDataset>,
}

impl Datasets {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset; names must be unique.
    pub fn push(&mut self, dataset: MapDataset) -> Result<()> {
        if self.entries.iter().any(|d| d.name == dataset.name) {
            return Err(Error::Validation(format!(
                "duplicate dataset name '{}'",
                dataset.name
            )));
        }
        self.entries.push(dataset);
        Ok(())
    }

    /// Look up a dataset by name.
    pub fn get(&self, name: &str) -> Option<&MapDataset> {
        self.entries.iter().find(|d| d.name == name)
    }

    /// Look up a dataset by name, mutable.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut MapDataset> {
        self.entries.iter_mut().find(|d| d.name == name)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MapDataset> {
        self.entries.iter()
    }

    /// Iterate in insertion order, mutable.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MapDataset> {
        self.entries.iter_mut()
    }

    /// Number of datasets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<MapDataset>> for Datasets {
    fn from(entries: Vec<MapDataset>) -> Self {
        Self { entries }
    }
}
