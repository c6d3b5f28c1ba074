//! Field-of-view background normalization.
//!
//! Fits a multiplicative correction `norm * (E/E_ref)^(-tilt)` of the
//! background template to the counts outside the exclusion region, by
//! minimizing the Cash statistic. The per-bin statistic only depends on the
//! counts and background sums over usable pixels, so the fit works on
//! per-energy-bin sufficient statistics rather than on the full cube.
//!
//! The norm-only fit has the closed-form solution `norm = ΣN / ΣB`; the
//! two-parameter fit seeds from it and runs the bounded L-BFGS optimizer.

use ndarray::Array2;
use sf_core::stats::cash;
use sf_core::{Error, LbfgsOptimizer, ObjectiveFunction, Result};
use sf_model::{FovBackgroundModel, Model};

use crate::dataset::MapDataset;

/// Which correction parameters are fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundMethod {
    /// Fit the normalization only.
    Norm,
    /// Fit normalization and energy tilt.
    NormTilt,
}

/// What to do when the correction cannot be constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Drop the dataset from the analysis (logged).
    Reject,
    /// Keep the nominal correction (norm 1, tilt 0), explicitly opted in.
    KeepNominal,
    /// Surface the error to the caller.
    Error,
}

/// Result of one background-normalization fit.
#[derive(Debug, Clone)]
pub struct FovBackgroundFit {
    /// Fitted normalization.
    pub norm: f64,
    /// Fitted tilt (0 for the norm-only method).
    pub tilt: f64,
    /// Cash statistic at the fitted correction.
    pub stat: f64,
    /// Number of energy bins that entered the fit.
    pub n_bins: usize,
}

/// Per-energy-bin sufficient statistics of the usable region.
struct BinStats {
    counts: Vec<f64>,
    background: Vec<f64>,
    energy: Vec<f64>,
}

/// Cash objective over (norm, tilt).
struct TiltObjective<'a> {
    stats: &'a BinStats,
    reference: f64,
}

impl ObjectiveFunction for TiltObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let (norm, tilt) = (params[0], params[1]);
        let mut acc = 0.0;
        for ((&n, &b), &e) in self
            .stats
            .counts
            .iter()
            .zip(self.stats.background.iter())
            .zip(self.stats.energy.iter())
        {
            let factor = norm * (e / self.reference).powf(-tilt);
            acc += cash(n, factor * b);
        }
        Ok(acc)
    }
}

/// Fits the background correction of reduced datasets.
#[derive(Debug, Clone)]
pub struct FovBackgroundMaker {
    method: BackgroundMethod,
    exclusion: Option<Array2<bool>>,
    on_failure: FallbackPolicy,
    reference_tev: f64,
}

impl FovBackgroundMaker {
    /// Maker with the given method, rejecting unconstrainable datasets.
    pub fn new(method: BackgroundMethod) -> Self {
        Self { method, exclusion: None, on_failure: FallbackPolicy::Reject, reference_tev: 1.0 }
    }

    /// Builder: spatial exclusion mask, `true` marking excluded pixels
    /// (known sources). Shape must match the dataset grids.
    pub fn with_exclusion(mut self, exclusion: Array2<bool>) -> Self {
        self.exclusion = Some(exclusion);
        self
    }

    /// Builder: fallback policy for unconstrainable datasets.
    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Builder: reference energy of the tilt term (TeV).
    pub fn with_reference(mut self, reference_tev: f64) -> Self {
        self.reference_tev = reference_tev;
        self
    }

    /// Fit the correction and write it into the dataset's background model
    /// (attached if missing).
    ///
    /// `Ok(None)` means the dataset could not be constrained and the policy
    /// is [`FallbackPolicy::Reject`]; the caller drops it from the analysis.
    pub fn run(&self, dataset: &mut MapDataset) -> Result<Option<FovBackgroundFit>> {
        let fit = match self.fit(dataset) {
            Ok(fit) => fit,
            Err(e @ Error::Underconstrained(_)) | Err(e @ Error::NonConvergence(_)) => {
                match self.on_failure {
                    FallbackPolicy::Reject => {
                        log::warn!("rejecting dataset '{}': {e}", dataset.name);
                        return Ok(None);
                    }
                    FallbackPolicy::KeepNominal => {
                        log::warn!("keeping nominal background for '{}': {e}", dataset.name);
                        FovBackgroundFit { norm: 1.0, tilt: 0.0, stat: f64::NAN, n_bins: 0 }
                    }
                    FallbackPolicy::Error => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.write_model(dataset, &fit)?;
        Ok(Some(fit))
    }

    /// Fit a batch, dropping rejected datasets.
    pub fn run_batch(&self, datasets: Vec<MapDataset>) -> Result<Vec<MapDataset>> {
        let mut kept = Vec::with_capacity(datasets.len());
        for mut dataset in datasets {
            if self.run(&mut dataset)?.is_some() {
                kept.push(dataset);
            }
        }
        Ok(kept)
    }

    fn write_model(&self, dataset: &mut MapDataset, fit: &FovBackgroundFit) -> Result<()> {
        if dataset.models.background().is_none() {
            let model = FovBackgroundModel::new(&dataset.name, self.reference_tev);
            dataset.models.attach(Model::FovBackground(model))?;
        }
        let model = dataset
            .models
            .background_mut()
            .ok_or_else(|| Error::InvalidModel("background model vanished".to_string()))?;
        model.norm.set_value(fit.norm)?;
        if self.method == BackgroundMethod::NormTilt {
            model.tilt.thaw();
            model.tilt.set_value(fit.tilt)?;
        }
        Ok(())
    }

    fn fit(&self, dataset: &MapDataset) -> Result<FovBackgroundFit> {
        let stats = self.bin_stats(dataset)?;
        let n_free = match self.method {
            BackgroundMethod::Norm => 1,
            BackgroundMethod::NormTilt => 2,
        };
        if stats.counts.len() < n_free {
            return Err(Error::Underconstrained(format!(
                "{} usable energy bins for {} free parameters",
                stats.counts.len(),
                n_free
            )));
        }

        let sum_n: f64 = stats.counts.iter().sum();
        let sum_b: f64 = stats.background.iter().sum();
        let norm0 = sum_n / sum_b;

        match self.method {
            BackgroundMethod::Norm => {
                // The 1-D Cash minimum is the counts-to-background ratio.
                let objective = TiltObjective { stats: &stats, reference: self.reference_tev };
                let stat = objective.eval(&[norm0, 0.0])?;
                Ok(FovBackgroundFit { norm: norm0, tilt: 0.0, stat, n_bins: stats.counts.len() })
            }
            BackgroundMethod::NormTilt => {
                let objective = TiltObjective { stats: &stats, reference: self.reference_tev };
                let optimizer = LbfgsOptimizer::default();
                let result = optimizer.minimize(
                    &objective,
                    &[norm0.clamp(1e-3, 1e3), 0.0],
                    &[(1e-3, 1e3), (-5.0, 5.0)],
                )?;
                if !result.converged {
                    return Err(Error::NonConvergence(format!(
                        "background fit: {}",
                        result.message
                    )));
                }
                Ok(FovBackgroundFit {
                    norm: result.parameters[0],
                    tilt: result.parameters[1],
                    stat: result.fval,
                    n_bins: stats.counts.len(),
                })
            }
        }
    }

    /// Counts/background sums per energy bin over safe, non-excluded pixels.
    fn bin_stats(&self, dataset: &MapDataset) -> Result<BinStats> {
        let (n_reco, ny, nx) = dataset.geom.cube_shape();
        if let Some(excl) = &self.exclusion {
            if excl.dim() != (ny, nx) {
                return Err(Error::Validation(format!(
                    "exclusion mask shape {:?} does not match the grid ({ny}, {nx})",
                    excl.dim()
                )));
            }
        }

        let centers = dataset.geom.axis().centers();
        let mut stats = BinStats { counts: vec![], background: vec![], energy: vec![] };
        for k in 0..n_reco {
            let mut n_sum = 0.0;
            let mut b_sum = 0.0;
            for iy in 0..ny {
                for ix in 0..nx {
                    if !dataset.mask_safe[(k, iy, ix)] {
                        continue;
                    }
                    if let Some(excl) = &self.exclusion {
                        if excl[(iy, ix)] {
                            continue;
                        }
                    }
                    n_sum += dataset.counts[(k, iy, ix)] as f64;
                    b_sum += dataset.background[(k, iy, ix)];
                }
            }
            if b_sum > 0.0 {
                stats.counts.push(n_sum);
                stats.background.push(b_sum);
                stats.energy.push(centers[k]);
            }
        }

        if stats.background.is_empty() {
            return Err(Error::Underconstrained(
                "no usable bins with nonzero background".to_string(),
            ));
        }
        Ok(stats)
    }
}
