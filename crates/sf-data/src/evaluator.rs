//! Predicted-counts evaluation.
//!
//! Folds each sky model through the dataset's responses:
//! integral flux per true-energy bin × exposure × spatial template,
//! PSF-convolved, then migrated to reconstructed energy, plus the scaled
//! background template.
//!
//! The spatial × exposure × PSF part of the fold is by far the most
//! expensive and does not depend on spectral parameters, so the evaluator
//! caches it per model, keyed on the spatial parameter values. A fit that
//! only moves spectral parameters (the common case with frozen positions)
//! convolves once per model instead of once per iteration.

use ndarray::{s, Array3};
use sf_core::{Error, Result};
use sf_model::SkyModel;
use std::collections::HashMap;

use crate::dataset::MapDataset;

struct CachedTemplate {
    /// Spatial parameter values the template was built at.
    key: Vec<f64>,
    /// Spatial × exposure, PSF-convolved, shape (n_true, ny, nx).
    template: Array3<f64>,
}

/// Stateful npred evaluator with per-model template caching.
#[derive(Default)]
pub struct NpredEvaluator {
    cache: HashMap<(String, String), CachedTemplate>,
}

impl NpredEvaluator {
    /// Fresh evaluator with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicted counts of `dataset` under its attached models,
    /// shape (n_reco, ny, nx).
    pub fn npred(&mut self, dataset: &MapDataset) -> Result<Array3<f64>> {
        let mut npred = self.npred_background(dataset);
        for model in dataset.models.sky_models().cloned().collect::<Vec<_>>() {
            npred += &self.npred_sky(dataset, &model)?;
        }
        Ok(npred)
    }

    /// Background template scaled by the dataset's background model, or the
    /// bare template when none is attached.
    fn npred_background(&self, dataset: &MapDataset) -> Array3<f64> {
        let bkg_model = dataset
            .models
            .background()
            .filter(|b| b.dataset_name == dataset.name);
        match bkg_model {
            Some(model) => {
                let mut out = dataset.background.clone();
                for (k, e_k) in dataset.geom.axis().centers().iter().enumerate() {
                    let factor = model.factor(*e_k);
                    out.slice_mut(s![k, .., ..]).mapv_inplace(|v| v * factor);
                }
                out
            }
            None => dataset.background.clone(),
        }
    }

    /// Predicted counts of one sky model.
    fn npred_sky(&mut self, dataset: &MapDataset, model: &SkyModel) -> Result<Array3<f64>> {
        let template = self.template(dataset, model)?;

        let n_true = dataset.energy_true.n_bins();
        let mut cube = template.clone();
        for t in 0..n_true {
            let (lo, hi) = dataset.energy_true.bin_edges(t);
            let flux = model.spectral.integral(lo, hi)?;
            cube.slice_mut(s![t, .., ..]).mapv_inplace(|v| v * flux);
        }

        match &dataset.edisp {
            Some(edisp) => edisp.apply(&cube),
            None => {
                // Without a migration kernel the true and reconstructed
                // axes must coincide.
                if !dataset.energy_true.approx_eq(dataset.geom.axis()) {
                    return Err(Error::Validation(format!(
                        "dataset '{}' has no energy-migration kernel and \
                         mismatched energy axes",
                        dataset.name
                    )));
                }
                Ok(cube)
            }
        }
    }

    /// Spatial × exposure template, PSF-convolved, cached per model.
    fn template(&mut self, dataset: &MapDataset, model: &SkyModel) -> Result<Array3<f64>> {
        let key: Vec<f64> = model.spatial.parameters().iter().map(|p| p.value()).collect();
        let cache_key = (dataset.name.clone(), model.name.clone());
        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.key == key {
                return Ok(cached.template.clone());
            }
        }

        let spatial = model.spatial.evaluate(&dataset.geom)?;
        let mut template = dataset.exposure.clone();
        for mut plane in template.outer_iter_mut() {
            plane *= &spatial;
        }
        if let Some(psf) = &dataset.psf {
            template = psf.apply(&template)?;
        }

        self.cache.insert(cache_key, CachedTemplate { key, template: template.clone() });
        Ok(template)
    }
}
