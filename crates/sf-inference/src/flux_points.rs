//! Spectral flux-point estimation.
//!
//! For each estimation bin the datasets are sliced to the matching
//! reconstructed-energy range and the source amplitude is refitted,
//! profiling the likelihood for asymmetric errors, a detection test
//! statistic, and an upper limit where the signal is weak. Bins are
//! independent, so they run as parallel rayon tasks and are reassembled in
//! energy order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sf_core::{Error, OptimizerConfig, Result};
use sf_data::Datasets;
use sf_model::SkyModel;

use crate::fit::Fit;

/// One estimated flux point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxPoint {
    /// Reference energy (TeV), the log-center of the bin.
    pub e_ref: f64,
    /// Lower bin edge (TeV).
    pub e_min: f64,
    /// Upper bin edge (TeV).
    pub e_max: f64,
    /// Differential flux at `e_ref` (cm⁻² s⁻¹ TeV⁻¹).
    pub dnde: f64,
    /// Downward error (positive magnitude).
    pub dnde_err_lo: f64,
    /// Upward error (positive magnitude).
    pub dnde_err_hi: f64,
    /// Upper limit, present when the detection is weak.
    pub dnde_ul: Option<f64>,
    /// Detection test statistic against zero flux.
    pub ts: f64,
    /// Degrees of freedom of the per-bin fit.
    pub n_dof: usize,
}

/// An energy-ordered set of flux points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxPoints {
    /// Points in ascending energy order.
    pub points: Vec<FluxPoint>,
}

impl FluxPoints {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate in energy order.
    pub fn iter(&self) -> impl Iterator<Item = &FluxPoint> {
        self.points.iter()
    }
}

/// Estimates flux points for one source over a set of estimation bins.
#[derive(Debug, Clone)]
pub struct FluxPointsEstimator {
    energy_edges: Vec<f64>,
    source: String,
    n_sigma: f64,
    n_sigma_ul: f64,
    ul_threshold: f64,
    reoptimize: bool,
    config: OptimizerConfig,
}

impl FluxPointsEstimator {
    /// Estimator over the given estimation-bin edges for the named source.
    /// Defaults: 1σ errors, 2σ upper limits reported below √TS = 2, no
    /// nuisance reoptimization.
    pub fn new(energy_edges: Vec<f64>, source: &str) -> Self {
        Self {
            energy_edges,
            source: source.to_string(),
            n_sigma: 1.0,
            n_sigma_ul: 2.0,
            ul_threshold: 2.0,
            reoptimize: false,
            config: OptimizerConfig::default(),
        }
    }

    /// Builder: error level in sigma.
    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    /// Builder: upper-limit level in sigma.
    pub fn with_n_sigma_ul(mut self, n_sigma_ul: f64) -> Self {
        self.n_sigma_ul = n_sigma_ul;
        self
    }

    /// Builder: √TS below which an upper limit is reported.
    pub fn with_ul_threshold(mut self, threshold: f64) -> Self {
        self.ul_threshold = threshold;
        self
    }

    /// Builder: refit the remaining free parameters in every bin.
    pub fn with_reoptimize(mut self, reoptimize: bool) -> Self {
        self.reoptimize = reoptimize;
        self
    }

    /// Builder: optimizer configuration for the per-bin fits.
    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Estimate all bins.
    pub fn run(&self, datasets: &Datasets) -> Result<FluxPoints> {
        if self.energy_edges.len() < 2 {
            return Err(Error::Validation(
                "flux-point estimation needs at least one energy bin".to_string(),
            ));
        }
        if !datasets.iter().any(|ds| ds.models.sky_model(&self.source).is_some()) {
            return Err(Error::Validation(format!(
                "source '{}' is not attached to any dataset",
                self.source
            )));
        }

        let bins: Vec<(f64, f64)> = self
            .energy_edges
            .windows(2)
            .map(|w| (w[0], w[1]))
            .collect();

        let points: Result<Vec<FluxPoint>> = bins
            .par_iter()
            .map(|&(e_min, e_max)| self.estimate_bin(datasets, e_min, e_max))
            .collect();
        Ok(FluxPoints { points: points? })
    }

    /// Estimate a single bin.
    fn estimate_bin(&self, datasets: &Datasets, e_min: f64, e_max: f64) -> Result<FluxPoint> {
        let sliced = self.slice_and_freeze(datasets, e_min, e_max)?;
        let e_ref = (e_min * e_max).sqrt();

        // Best-fit amplitude in this bin. A non-converged fit leaves the
        // models at their start values, so take the best-effort amplitude
        // from the result itself; dnde, TS and the profiled errors then all
        // describe the same point.
        let mut work = sliced.clone();
        let fit = Fit::with_config(self.config.clone());
        let result = fit.fit(&mut work)?;
        let stat_best = result.stat;
        let amplitude = match result.value("flux-point-norm") {
            Some(value) => value,
            None => self.source_amplitude(&work)?,
        };
        if !result.converged {
            log::warn!(
                "flux point ({e_min:.3}, {e_max:.3}) TeV did not converge: {}",
                result.message
            );
        }

        let ts = self.stat_at(&sliced, 0.0)? - stat_best;

        // Profile the amplitude for asymmetric errors.
        let delta = self.n_sigma * self.n_sigma;
        let err_hi = self.profile_upward(&sliced, amplitude, stat_best, delta)? - amplitude;
        let err_lo = amplitude - self.profile_downward(&sliced, amplitude, stat_best, delta)?;

        let ul = if ts.max(0.0).sqrt() < self.ul_threshold {
            let delta_ul = self.n_sigma_ul * self.n_sigma_ul;
            Some(self.profile_upward(&sliced, amplitude, stat_best, delta_ul)?)
        } else {
            None
        };

        // Amplitude-linear conversion to differential flux at e_ref.
        let shape = self.source_shape(&sliced, e_ref)?;
        Ok(FluxPoint {
            e_ref,
            e_min,
            e_max,
            dnde: amplitude * shape,
            dnde_err_lo: err_lo * shape,
            dnde_err_hi: err_hi * shape,
            dnde_ul: ul.map(|a| a * shape),
            ts,
            n_dof: 1,
        })
    }

    /// Slice every dataset to the bin and freeze everything except the
    /// source amplitude (and, with reoptimization, whatever was free).
    fn slice_and_freeze(&self, datasets: &Datasets, e_min: f64, e_max: f64) -> Result<Datasets> {
        let mut out = Datasets::new();
        for dataset in datasets.iter() {
            let range = dataset.geom.axis().group_range(e_min, e_max)?;
            let mut sliced = dataset.slice_energy(range)?;
            for model in sliced.models.iter_mut() {
                let is_source = model.name() == self.source;
                for p in model.parameters_mut() {
                    if is_source && p.name() == "amplitude" {
                        p.thaw();
                        p.set_link("flux-point-norm");
                    } else if !self.reoptimize {
                        p.freeze();
                    }
                }
            }
            out.push(sliced)?;
        }
        Ok(out)
    }

    fn source_model<'a>(&self, datasets: &'a Datasets) -> Result<&'a SkyModel> {
        datasets
            .iter()
            .find_map(|ds| ds.models.sky_model(&self.source))
            .ok_or_else(|| {
                Error::Validation(format!("source '{}' not found", self.source))
            })
    }

    fn source_amplitude(&self, datasets: &Datasets) -> Result<f64> {
        let model = self.source_model(datasets)?;
        model
            .spectral
            .parameter("amplitude")
            .map(|p| p.value())
            .ok_or_else(|| Error::InvalidModel("source has no amplitude parameter".to_string()))
    }

    /// Differential flux at `e_ref` per unit amplitude.
    fn source_shape(&self, datasets: &Datasets, e_ref: f64) -> Result<f64> {
        let model = self.source_model(datasets)?;
        let mut spectral = model.spectral.clone();
        spectral
            .parameter_mut("amplitude")
            .ok_or_else(|| Error::InvalidModel("source has no amplitude parameter".to_string()))?
            .set_value(1.0)?;
        Ok(spectral.evaluate(e_ref))
    }

    /// Profile statistic at a fixed source amplitude.
    fn stat_at(&self, sliced: &Datasets, amplitude: f64) -> Result<f64> {
        let mut work = sliced.clone();
        let mut any_free = false;
        for dataset in work.iter_mut() {
            for model in dataset.models.iter_mut() {
                let is_source = model.name() == self.source;
                for p in model.parameters_mut() {
                    if is_source && p.name() == "amplitude" {
                        p.set_value(amplitude)?;
                        p.freeze();
                    } else if p.is_free() {
                        any_free = true;
                    }
                }
            }
        }
        let fit = Fit::with_config(self.config.clone());
        if self.reoptimize && any_free {
            Ok(fit.fit(&mut work)?.stat)
        } else {
            fit.stat(&work)
        }
    }

    /// Smallest amplitude above `best` where the profile rises by `delta`.
    fn profile_upward(
        &self,
        sliced: &Datasets,
        best: f64,
        stat_best: f64,
        delta: f64,
    ) -> Result<f64> {
        // Bracket the crossing with geometric steps, then bisect.
        let scale = best.abs().max(self.amplitude_scale(sliced)?);
        let mut step = scale;
        let mut hi = best + step;
        for _ in 0..60 {
            if self.stat_at(sliced, hi)? - stat_best >= delta {
                break;
            }
            step *= 2.0;
            hi = best + step;
        }
        self.bisect(sliced, best, hi, stat_best, delta)
    }

    /// Crossing below `best`, floored at zero flux.
    fn profile_downward(
        &self,
        sliced: &Datasets,
        best: f64,
        stat_best: f64,
        delta: f64,
    ) -> Result<f64> {
        if self.stat_at(sliced, 0.0)? - stat_best < delta {
            // The profile never rises enough before zero.
            return Ok(0.0);
        }
        let lo = self.bisect(sliced, best, 0.0, stat_best, delta)?;
        Ok(lo)
    }

    /// Bisect for `stat(x) - stat_best = delta` between `inside` (below the
    /// crossing) and `outside` (at or beyond it).
    fn bisect(
        &self,
        sliced: &Datasets,
        mut inside: f64,
        mut outside: f64,
        stat_best: f64,
        delta: f64,
    ) -> Result<f64> {
        for _ in 0..60 {
            let mid = 0.5 * (inside + outside);
            if (outside - inside).abs() <= 1e-4 * (inside.abs() + outside.abs() + 1e-300) {
                return Ok(mid);
            }
            if self.stat_at(sliced, mid)? - stat_best < delta {
                inside = mid;
            } else {
                outside = mid;
            }
        }
        Ok(0.5 * (inside + outside))
    }

    /// A positive amplitude scale for bracketing, from the initial model.
    fn amplitude_scale(&self, sliced: &Datasets) -> Result<f64> {
        let amp = self.source_amplitude(sliced)?;
        Ok(if amp > 0.0 { amp } else { 1e-13 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sf_maps::{EnergyAxis, MapGeom, SkyCoord};
    use sf_model::{Model, SkyModel, SpatialModel, SpectralModel};

    use sf_data::irf::EnergyDispersion;
    use sf_data::MapDataset;

    /// Source-only dataset with identity migration and flat exposure,
    /// counts set to the model prediction.
    fn asimov_dataset() -> Datasets {
        let axis = EnergyAxis::from_bounds(1.0, 16.0, 4).unwrap();
        let geom = MapGeom::new(SkyCoord::new(0.0, 0.0), 0.05, (21, 21), axis.clone()).unwrap();
        let mut ds = MapDataset::empty("ds", geom, axis.clone()).unwrap();
        ds.exposure.fill(1e13);
        ds.mask_safe.fill(true);
        let edisp = EnergyDispersion::constant(axis.clone(), 0.0).unwrap();
        ds.edisp = Some(edisp.kernel(&axis, &axis).unwrap());

        let mut model = SkyModel::new(
            "src",
            SpatialModel::point(0.0, 0.0),
            SpectralModel::power_law(1e-11, 2.0, 1.0),
        );
        model.spatial.freeze_all();
        model.spectral.parameter_mut("index").unwrap().freeze();
        ds.models.attach(Model::Sky(model)).unwrap();
        ds.set_counts_asimov().unwrap();

        let mut datasets = Datasets::new();
        datasets.push(ds).unwrap();
        datasets
    }

    #[test]
    fn test_flux_points_match_model_on_asimov_data() {
        let datasets = asimov_dataset();
        let edges: Vec<f64> = datasets.get("ds").unwrap().geom.axis().edges().to_vec();
        let estimator = FluxPointsEstimator::new(edges, "src");
        let points = estimator.run(&datasets).unwrap();

        assert_eq!(points.len(), 4);
        let truth = SpectralModel::power_law(1e-11, 2.0, 1.0);
        for point in points.iter() {
            // Counts are rounded predictions, so a few percent of slack.
            assert_relative_eq!(point.dnde, truth.evaluate(point.e_ref), max_relative = 0.05);
            assert!(point.ts > 25.0, "strong source, got TS = {}", point.ts);
            assert!(point.dnde_ul.is_none());
            assert!(point.dnde_err_hi > 0.0);
            assert!(point.dnde_err_lo > 0.0);
            assert_eq!(point.n_dof, 1);
        }
    }

    #[test]
    fn test_upper_limit_reported_for_zero_signal() {
        let mut datasets = asimov_dataset();
        // Kill the signal: counts to zero, model amplitude stays free.
        datasets.get_mut("ds").unwrap().counts.fill(0);

        let edges = vec![1.0, 16.0];
        let estimator = FluxPointsEstimator::new(edges, "src");
        let points = estimator.run(&datasets).unwrap();
        let point = &points.points[0];

        assert!(point.ts < 4.0);
        let ul = point.dnde_ul.expect("weak signal must carry an upper limit");
        assert!(ul > point.dnde);
    }

    #[test]
    fn test_non_converged_bin_reports_best_effort_amplitude() {
        let mut datasets = asimov_dataset();
        // Start four orders of magnitude below the truth with a budget too
        // small to converge.
        let ds = datasets.get_mut("ds").unwrap();
        let model = ds.models.sky_model_mut("src").unwrap();
        model.spectral.parameter_mut("amplitude").unwrap().set_value(1e-15).unwrap();

        let config = OptimizerConfig { max_iter: 1, ..OptimizerConfig::default() };
        let estimator = FluxPointsEstimator::new(vec![1.0, 16.0], "src").with_config(config);
        let points = estimator.run(&datasets).unwrap();
        let point = &points.points[0];

        // The reported flux tracks the optimizer's best-effort point, not
        // the start value the unconverged fit leaves in the models.
        let start = SpectralModel::power_law(1e-15, 2.0, 1.0);
        assert!(
            point.dnde > 2.0 * start.evaluate(point.e_ref),
            "flux point stuck at the start amplitude: dnde = {}",
            point.dnde
        );
        assert!(point.dnde.is_finite());
        assert!(point.dnde_err_hi > 0.0);
    }

    #[test]
    fn test_unknown_source_rejected() {
        let datasets = asimov_dataset();
        let estimator = FluxPointsEstimator::new(vec![1.0, 16.0], "nope");
        assert!(estimator.run(&datasets).is_err());
    }

    #[test]
    fn test_misaligned_edges_rejected() {
        let datasets = asimov_dataset();
        let estimator = FluxPointsEstimator::new(vec![1.1, 16.0], "src");
        assert!(estimator.run(&datasets).is_err());
    }
}
