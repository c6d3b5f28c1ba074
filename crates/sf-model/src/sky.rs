//! Sky model composition and the field-of-view background model.

use crate::params::Parameter;
use crate::spatial::SpatialModel;
use crate::spectral::SpectralModel;

/// A source model: a spatial morphology crossed with a spectral shape.
#[derive(Debug, Clone)]
pub struct SkyModel {
    /// Unique model name within a `Models` collection.
    pub name: String,
    /// Spatial component.
    pub spatial: SpatialModel,
    /// Spectral component.
    pub spectral: SpectralModel,
}

impl SkyModel {
    /// Compose a sky model.
    pub fn new(name: &str, spatial: SpatialModel, spectral: SpectralModel) -> Self {
        Self { name: name.to_string(), spatial, spectral }
    }

    /// All parameters (spatial then spectral).
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut out = self.spatial.parameters();
        out.extend(self.spectral.parameters());
        out
    }

    /// All parameters, mutable (spatial then spectral).
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut out = self.spatial.parameters_mut();
        out.extend(self.spectral.parameters_mut());
        out
    }
}

/// Multiplicative correction to a dataset's background template:
/// `factor(E) = norm * (E / reference)^(-tilt)`.
///
/// The tilt is frozen by default; thaw it for the two-parameter correction.
#[derive(Debug, Clone)]
pub struct FovBackgroundModel {
    /// Name of the dataset this model corrects.
    pub dataset_name: String,
    /// Normalization.
    pub norm: Parameter,
    /// Energy tilt.
    pub tilt: Parameter,
    /// Reference energy (TeV), fixed.
    pub reference: f64,
}

impl FovBackgroundModel {
    /// Nominal correction (norm 1, tilt 0 frozen) for the named dataset.
    pub fn new(dataset_name: &str, reference: f64) -> Self {
        Self {
            dataset_name: dataset_name.to_string(),
            norm: Parameter::new("norm", 1.0).with_bounds(1e-3, 1e3),
            tilt: Parameter::new("tilt", 0.0).with_bounds(-5.0, 5.0).frozen(),
            reference,
        }
    }

    /// Model name within a `Models` collection.
    pub fn name(&self) -> String {
        format!("{}-bkg", self.dataset_name)
    }

    /// Correction factor at `energy` (TeV).
    pub fn factor(&self, energy: f64) -> f64 {
        self.norm.value() * (energy / self.reference).powf(-self.tilt.value())
    }

    /// All parameters.
    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.norm, &self.tilt]
    }

    /// All parameters, mutable.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.norm, &mut self.tilt]
    }
}
