//! The joint likelihood fit engine.
//!
//! `Fit` minimizes the total Cash statistic of a `Datasets` collection over
//! the order-stable union of free model parameters. Parameters carrying the
//! same link key collapse to a single optimizer slot, which is how one
//! background normalization (or one source) is shared across datasets.
//!
//! Covariance comes from the finite-difference Hessian of the statistic via
//! a damped Cholesky solve; because the Cash statistic is twice the
//! negative log-likelihood, the covariance is twice the inverted Hessian.

use nalgebra::DMatrix;
use sf_core::{
    Error, FitResult, LbfgsOptimizer, ObjectiveFunction, OptimizerConfig, Result,
};
use sf_data::{Datasets, NpredEvaluator};
use std::cell::RefCell;
use std::collections::HashMap;

/// Flattened free-parameter view over a `Datasets` collection.
///
/// Slots are assigned in walk order: datasets in insertion order, models in
/// attachment order, parameters in declaration order. Linked parameters
/// reuse the slot of their first occurrence.
pub struct ParameterSpace {
    names: Vec<String>,
    init: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    /// Slot index per free parameter, in walk order.
    slots: Vec<usize>,
}

impl ParameterSpace {
    /// Build the space, validating the models.
    pub fn build(datasets: &Datasets) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut init: Vec<f64> = Vec::new();
        let mut bounds: Vec<(f64, f64)> = Vec::new();
        let mut slots: Vec<usize> = Vec::new();
        let mut slot_by_link: HashMap<String, usize> = HashMap::new();

        for dataset in datasets.iter() {
            for model in dataset.models.iter() {
                let model_name = model.name();
                for p in model.parameters() {
                    if !p.is_free() {
                        continue;
                    }
                    if !p.in_bounds() {
                        return Err(Error::InvalidModel(format!(
                            "parameter '{}.{}.{}': initial value {} outside bounds {:?}",
                            dataset.name,
                            model_name,
                            p.name(),
                            p.value(),
                            p.bounds()
                        )));
                    }
                    match p.link() {
                        Some(key) => {
                            if let Some(&slot) = slot_by_link.get(key) {
                                if bounds[slot] != p.bounds() || init[slot] != p.value() {
                                    return Err(Error::InvalidModel(format!(
                                        "link '{key}': inconsistent value or bounds across \
                                         linked parameters"
                                    )));
                                }
                                slots.push(slot);
                            } else {
                                let slot = names.len();
                                slot_by_link.insert(key.to_string(), slot);
                                slots.push(slot);
                                names.push(key.to_string());
                                init.push(p.value());
                                bounds.push(p.bounds());
                            }
                        }
                        None => {
                            slots.push(names.len());
                            names.push(format!(
                                "{}.{}.{}",
                                dataset.name,
                                model_name,
                                p.name()
                            ));
                            init.push(p.value());
                            bounds.push(p.bounds());
                        }
                    }
                }
            }
        }

        if names.is_empty() {
            return Err(Error::InvalidModel(
                "no free parameters across the attached models".to_string(),
            ));
        }
        Ok(Self { names, init, bounds, slots })
    }

    /// Number of optimizer slots.
    pub fn dim(&self) -> usize {
        self.names.len()
    }

    /// Slot names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Initial slot values.
    pub fn init(&self) -> &[f64] {
        &self.init
    }

    /// Slot bounds.
    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    /// Per-slot magnitude scale, |init| or 1 for zero-valued slots.
    ///
    /// The optimizer and the finite-difference machinery work on
    /// `value / scale`, so a flux amplitude of 1e-11 and a spectral index
    /// of 2 are stepped with comparable relative sizes.
    pub fn scales(&self) -> Vec<f64> {
        self.init
            .iter()
            .map(|&v| if v.abs() > 0.0 { v.abs() } else { 1.0 })
            .collect()
    }

    /// Slot values clamped into their bounds.
    pub fn clamp(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.bounds.iter())
            .map(|(&v, &(lo, hi))| v.clamp(lo, hi))
            .collect()
    }

    /// Write slot values back into the models. The collection must have the
    /// same structure the space was built from.
    pub fn apply(&self, datasets: &mut Datasets, values: &[f64]) -> Result<()> {
        if values.len() != self.names.len() {
            return Err(Error::Validation(format!(
                "parameter vector length {} does not match {} slots",
                values.len(),
                self.names.len()
            )));
        }
        let mut walk = 0;
        for dataset in datasets.iter_mut() {
            for model in dataset.models.iter_mut() {
                for p in model.parameters_mut() {
                    if !p.is_free() {
                        continue;
                    }
                    let slot = *self.slots.get(walk).ok_or_else(|| {
                        Error::Validation(
                            "model structure changed since the space was built".to_string(),
                        )
                    })?;
                    p.set_value(values[slot])?;
                    walk += 1;
                }
            }
        }
        if walk != self.slots.len() {
            return Err(Error::Validation(
                "model structure changed since the space was built".to_string(),
            ));
        }
        Ok(())
    }
}

struct ObjectiveState {
    datasets: Datasets,
    evaluators: Vec<NpredEvaluator>,
}

/// Total-Cash objective over a working copy of the datasets, evaluated in
/// scaled parameter units.
struct StatObjective<'a> {
    space: &'a ParameterSpace,
    scales: Vec<f64>,
    state: RefCell<ObjectiveState>,
}

// SAFETY: the optimizer drives the objective from a single thread; the
// RefCell is never borrowed concurrently.
unsafe impl Send for StatObjective<'_> {}
unsafe impl Sync for StatObjective<'_> {}

impl StatObjective<'_> {
    fn new<'a>(space: &'a ParameterSpace, datasets: &Datasets) -> StatObjective<'a> {
        let evaluators = (0..datasets.len()).map(|_| NpredEvaluator::new()).collect();
        StatObjective {
            space,
            scales: space.scales(),
            state: RefCell::new(ObjectiveState { datasets: datasets.clone(), evaluators }),
        }
    }

    fn unscale(&self, scaled: &[f64]) -> Vec<f64> {
        scaled.iter().zip(self.scales.iter()).map(|(&v, &s)| v * s).collect()
    }
}

impl ObjectiveFunction for StatObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        // Finite-difference probes may step over a bound; evaluate at the
        // clamped point instead of rejecting.
        let clamped = self.space.clamp(&self.unscale(params));
        let mut state = self.state.borrow_mut();
        let ObjectiveState { datasets, evaluators } = &mut *state;
        self.space.apply(datasets, &clamped)?;

        let mut total = 0.0;
        for (dataset, evaluator) in datasets.iter().zip(evaluators.iter_mut()) {
            let npred = evaluator.npred(dataset)?;
            total += dataset.stat_for(&npred);
        }
        if !total.is_finite() {
            return Err(Error::Computation(format!(
                "non-finite fit statistic at {clamped:?}"
            )));
        }
        Ok(total)
    }
}

/// Check for identifiability issues based on the Hessian and uncertainties.
///
/// Returns human-readable warnings, empty when the model is well identified.
pub fn identifiability_warnings(
    hessian: &DMatrix<f64>,
    param_names: &[String],
    uncertainties: &[f64],
) -> Vec<String> {
    let n = param_names.len();
    let mut warnings = Vec::new();

    if n > 0 {
        let svd = hessian.clone().svd(false, false);
        let svals = &svd.singular_values;
        let s_max = svals.iter().fold(0.0_f64, |a, &b| a.max(b));
        let s_min = svals.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        if s_min > 0.0 {
            let cond = s_max / s_min;
            if cond > 1e8 {
                warnings.push(format!(
                    "Hessian condition number = {cond:.1e}: model may be poorly identified"
                ));
            }
        } else {
            warnings.push("Hessian is singular: model is not identifiable".into());
        }
    }

    for i in 0..n.min(uncertainties.len()) {
        if !uncertainties[i].is_finite() {
            warnings.push(format!(
                "Parameter '{}': uncertainty is {}",
                param_names[i], uncertainties[i]
            ));
        }
    }

    for i in 0..n {
        if hessian[(i, i)].abs() < 1e-12 {
            warnings.push(format!(
                "Parameter '{}': near-zero Hessian diagonal, not identifiable",
                param_names[i]
            ));
        }
    }

    warnings
}

/// Joint maximum-likelihood fit over map datasets.
#[derive(Clone, Default)]
pub struct Fit {
    config: OptimizerConfig,
}

impl Fit {
    /// Fit with the default optimizer configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit with a custom optimizer configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Total Cash statistic of the datasets at their current parameters.
    pub fn stat(&self, datasets: &Datasets) -> Result<f64> {
        let mut total = 0.0;
        for dataset in datasets.iter() {
            total += dataset.stat()?;
        }
        Ok(total)
    }

    /// Minimize the total statistic and report the fit.
    ///
    /// On a converged fit the best-fit values are written back into the
    /// attached models; otherwise the models (and always the data arrays)
    /// stay untouched and the result is flagged `converged = false`.
    pub fn fit(&self, datasets: &mut Datasets) -> Result<FitResult> {
        let space = ParameterSpace::build(datasets)?;
        let scales = space.scales();
        let objective = StatObjective::new(&space, datasets);

        // Optimize in scaled units so finite differences step sensibly for
        // parameters spanning many orders of magnitude.
        let init_scaled: Vec<f64> =
            space.init().iter().zip(scales.iter()).map(|(&v, &s)| v / s).collect();
        let bounds_scaled: Vec<(f64, f64)> = space
            .bounds()
            .iter()
            .zip(scales.iter())
            .map(|(&(lo, hi), &s)| (lo / s, hi / s))
            .collect();

        let optimizer = LbfgsOptimizer::new(self.config.clone());
        let result = optimizer.minimize(&objective, &init_scaled, &bounds_scaled)?;
        let best: Vec<f64> = space.clamp(&objective.unscale(&result.parameters));

        let n = space.dim();
        // Hessian of the statistic in scaled units; the covariance is
        // mapped back through cov_ij = cov_scaled_ij * scale_i * scale_j.
        let hessian = compute_hessian(&objective, &result.parameters)?;
        let diag_uncertainties: Vec<f64> = diagonal_uncertainties(&hessian, n)
            .iter()
            .zip(scales.iter())
            .map(|(&u, &s)| u * s)
            .collect();

        let (uncertainties, covariance) = match invert_hessian(&hessian, n) {
            Some(stat_cov) => {
                // stat = 2 * NLL, so covariance = 2 * H_stat⁻¹.
                let cov = stat_cov * 2.0;
                let mut all_ok = true;
                let mut uncertainties = Vec::with_capacity(n);
                for i in 0..n {
                    let var = cov[(i, i)] * scales[i] * scales[i];
                    if var.is_finite() && var > 0.0 {
                        uncertainties.push(var.sqrt());
                    } else {
                        all_ok = false;
                        uncertainties.push(diag_uncertainties[i]);
                    }
                }
                if all_ok {
                    let mut flat = Vec::with_capacity(n * n);
                    for i in 0..n {
                        for j in 0..n {
                            flat.push(cov[(i, j)] * scales[i] * scales[j]);
                        }
                    }
                    (uncertainties, Some(flat))
                } else {
                    log::warn!("invalid covariance diagonal; omitting covariance matrix");
                    (uncertainties, None)
                }
            }
            None => {
                log::warn!("Hessian inversion failed, using diagonal approximation");
                (diag_uncertainties, None)
            }
        };

        let warnings = identifiability_warnings(&hessian, space.names(), &uncertainties);
        for w in &warnings {
            log::warn!("{w}");
        }

        if result.converged {
            space.apply(datasets, &best)?;
        }

        Ok(FitResult {
            parameter_names: space.names().to_vec(),
            parameters: best,
            uncertainties,
            covariance,
            stat: result.fval,
            converged: result.converged,
            n_iter: result.n_iter,
            n_fev: result.n_fev,
            n_gev: result.n_gev,
            message: result.message,
            warnings,
        })
    }
}

/// Forward-difference Hessian of the objective from its gradient,
/// symmetrized.
fn compute_hessian(
    objective: &dyn ObjectiveFunction,
    best_params: &[f64],
) -> Result<DMatrix<f64>> {
    let n = best_params.len();
    let grad_center = objective.gradient(best_params)?;

    let mut hessian = DMatrix::zeros(n, n);
    for j in 0..n {
        let eps = 1e-4 * best_params[j].abs().max(1.0);

        let mut params_plus = best_params.to_vec();
        params_plus[j] += eps;
        let grad_plus = objective.gradient(&params_plus)?;

        for i in 0..n {
            hessian[(i, j)] = (grad_plus[i] - grad_center[i]) / eps;
        }
    }

    let ht = hessian.transpose();
    hessian = (&hessian + &ht) * 0.5;
    Ok(hessian)
}

fn invert_hessian(hessian: &DMatrix<f64>, n: usize) -> Option<DMatrix<f64>> {
    // Even at a valid minimum the numerically estimated Hessian can be
    // slightly indefinite. Prefer a damped Cholesky solve over a raw
    // inverse, which would turn small negative eigenvalues into huge
    // negative variances.
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;

    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            return Some(chol.solve(&identity));
        }
        if attempt + 1 == max_attempts {
            break;
        }
        let next_damping = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        let add = next_damping - damping;
        for i in 0..n {
            h_damped[(i, i)] += add;
        }
        damping = next_damping;
    }

    let cov = h_damped.lu().try_inverse()?;
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(cov)
}

/// Uncertainties from the Hessian diagonal alone, the fallback when the
/// full inversion fails. Carries the stat-vs-NLL factor of two.
fn diagonal_uncertainties(hessian: &DMatrix<f64>, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let denom = hessian[(i, i)].abs().max(1e-12);
            (2.0 / denom).sqrt()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sf_maps::{EnergyAxis, MapGeom, SkyCoord};
    use sf_model::{FovBackgroundModel, Model};

    use sf_data::MapDataset;

    fn dataset(name: &str, norm_truth: f64) -> MapDataset {
        let axis = EnergyAxis::from_bounds(0.5, 50.0, 5).unwrap();
        let geom = MapGeom::new(SkyCoord::new(0.0, 0.0), 0.05, (31, 31), axis).unwrap();
        let energy_true = EnergyAxis::from_bounds(0.3, 100.0, 8).unwrap();
        let mut ds = MapDataset::empty(name, geom, energy_true).unwrap();
        ds.mask_safe.fill(true);
        ds.background.fill(10.0);
        ds.counts.fill((10.0 * norm_truth) as u64);
        ds.models
            .attach(Model::FovBackground(FovBackgroundModel::new(name, 1.0)))
            .unwrap();
        ds
    }

    #[test]
    fn test_fit_background_norm() {
        let mut datasets = Datasets::new();
        datasets.push(dataset("ds", 1.5)).unwrap();

        let result = Fit::new().fit(&mut datasets).unwrap();
        assert!(result.converged, "{}", result.message);
        assert_eq!(result.parameter_names, vec!["ds.ds-bkg.norm".to_string()]);
        assert_relative_eq!(result.parameters[0], 1.5, max_relative = 1e-4);

        // Written back into the model.
        let norm = datasets.get("ds").unwrap().models.background().unwrap().norm.value();
        assert_relative_eq!(norm, 1.5, max_relative = 1e-4);

        // Poisson error on the total-count ratio: sigma = norm / sqrt(N).
        let n_total: f64 = datasets.get("ds").unwrap().counts.iter().map(|&n| n as f64).sum();
        let expected_sigma = 1.5 / n_total.sqrt();
        assert_relative_eq!(result.uncertainties[0], expected_sigma, max_relative = 0.2);
    }

    #[test]
    fn test_linked_norm_shared_across_datasets() {
        let mut a = dataset("a", 2.0);
        let mut b = dataset("b", 2.0);
        a.models.background_mut().unwrap().norm.set_link("bkg-norm");
        b.models.background_mut().unwrap().norm.set_link("bkg-norm");

        let mut datasets = Datasets::new();
        datasets.push(a).unwrap();
        datasets.push(b).unwrap();

        let space = ParameterSpace::build(&datasets).unwrap();
        assert_eq!(space.dim(), 1);
        assert_eq!(space.names(), ["bkg-norm"]);

        let result = Fit::new().fit(&mut datasets).unwrap();
        assert!(result.converged, "{}", result.message);
        assert_relative_eq!(result.value("bkg-norm").unwrap(), 2.0, max_relative = 1e-4);

        // Both models received the shared value.
        for name in ["a", "b"] {
            let norm = datasets.get(name).unwrap().models.background().unwrap().norm.value();
            assert_relative_eq!(norm, 2.0, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_no_free_parameters_is_invalid() {
        let mut ds = dataset("ds", 1.0);
        ds.models.freeze_all();
        let mut datasets = Datasets::new();
        datasets.push(ds).unwrap();
        match Fit::new().fit(&mut datasets) {
            Err(Error::InvalidModel(_)) => {}
            other => panic!("expected invalid-model error, got {other:?}"),
        }
    }

    #[test]
    fn test_inconsistent_link_rejected() {
        let mut a = dataset("a", 1.0);
        let mut b = dataset("b", 1.0);
        a.models.background_mut().unwrap().norm.set_link("k");
        let bkg = b.models.background_mut().unwrap();
        bkg.norm.set_link("k");
        bkg.norm.set_value(2.0).unwrap();

        let mut datasets = Datasets::new();
        datasets.push(a).unwrap();
        datasets.push(b).unwrap();
        match ParameterSpace::build(&datasets) {
            Err(Error::InvalidModel(_)) => {}
            Err(other) => panic!("expected invalid-model error, got {other}"),
            Ok(_) => panic!("expected invalid-model error"),
        }
    }

    #[test]
    fn test_failed_fit_leaves_models_untouched() {
        // A dataset whose background model cannot converge within one
        // iteration keeps its initial norm.
        let mut datasets = Datasets::new();
        datasets.push(dataset("ds", 3.0)).unwrap();

        let config = OptimizerConfig { max_iter: 1, tol: 1e-14, m: 10 };
        let result = Fit::with_config(config).fit(&mut datasets).unwrap();
        if !result.converged {
            let norm = datasets.get("ds").unwrap().models.background().unwrap().norm.value();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
        }
    }
}
