//! Spectral shapes.
//!
//! Differential flux models `dnde(E)` in cm⁻² s⁻¹ TeV⁻¹ with energies in
//! TeV. All shapes are linear in their amplitude parameter, which the
//! flux-points estimator relies on when profiling a per-bin normalization.

use crate::params::Parameter;
use sf_core::{Error, Result};

/// Nodes used for log-space numerical bin integration.
const N_INTEGRATION_NODES: usize = 17;

/// A parametric spectral shape.
#[derive(Debug, Clone)]
pub enum SpectralModel {
    /// `dnde = amplitude * (E/reference)^(-index)`
    PowerLaw {
        /// Differential flux at the reference energy (cm⁻² s⁻¹ TeV⁻¹).
        amplitude: Parameter,
        /// Spectral index.
        index: Parameter,
        /// Reference energy (TeV), fixed.
        reference: f64,
    },
    /// `dnde = amplitude * (E/reference)^(-index) * exp(-lambda * E)`
    ExpCutoffPowerLaw {
        /// Differential flux at the reference energy (cm⁻² s⁻¹ TeV⁻¹).
        amplitude: Parameter,
        /// Spectral index.
        index: Parameter,
        /// Inverse cutoff energy (TeV⁻¹).
        lambda: Parameter,
        /// Reference energy (TeV), fixed.
        reference: f64,
    },
}

impl SpectralModel {
    /// Power-law shape with default bounds.
    pub fn power_law(amplitude: f64, index: f64, reference: f64) -> Self {
        Self::PowerLaw {
            amplitude: Parameter::new("amplitude", amplitude).with_bounds(0.0, f64::INFINITY),
            index: Parameter::new("index", index).with_bounds(-5.0, 5.0),
            reference,
        }
    }

    /// Exponential-cutoff power law with default bounds.
    pub fn exp_cutoff_power_law(amplitude: f64, index: f64, lambda: f64, reference: f64) -> Self {
        Self::ExpCutoffPowerLaw {
            amplitude: Parameter::new("amplitude", amplitude).with_bounds(0.0, f64::INFINITY),
            index: Parameter::new("index", index).with_bounds(-5.0, 5.0),
            lambda: Parameter::new("lambda", lambda).with_bounds(0.0, 10.0),
            reference,
        }
    }

    /// Differential flux at `energy` (TeV).
    pub fn evaluate(&self, energy: f64) -> f64 {
        match self {
            Self::PowerLaw { amplitude, index, reference } => {
                amplitude.value() * (energy / reference).powf(-index.value())
            }
            Self::ExpCutoffPowerLaw { amplitude, index, lambda, reference } => {
                amplitude.value()
                    * (energy / reference).powf(-index.value())
                    * (-lambda.value() * energy).exp()
            }
        }
    }

    /// Integral flux over `(e_min, e_max)` in cm⁻² s⁻¹.
    ///
    /// Analytic for the power law, log-space trapezoid otherwise.
    pub fn integral(&self, e_min: f64, e_max: f64) -> Result<f64> {
        if !(e_min > 0.0 && e_max > e_min) {
            return Err(Error::Validation(format!(
                "invalid integration range: ({e_min}, {e_max}) TeV"
            )));
        }
        match self {
            Self::PowerLaw { amplitude, index, reference } => {
                let gamma = index.value();
                let a = amplitude.value();
                let x0 = e_min / reference;
                let x1 = e_max / reference;
                if (gamma - 1.0).abs() < 1e-9 {
                    Ok(a * reference * (x1 / x0).ln())
                } else {
                    let p = 1.0 - gamma;
                    Ok(a * reference * (x1.powf(p) - x0.powf(p)) / p)
                }
            }
            Self::ExpCutoffPowerLaw { .. } => Ok(self.integral_log_trapezoid(e_min, e_max)),
        }
    }

    /// Trapezoid rule in ln(E): `∫ f(E) dE = ∫ f(E) E dlnE`.
    fn integral_log_trapezoid(&self, e_min: f64, e_max: f64) -> f64 {
        let log_min = e_min.ln();
        let step = (e_max.ln() - log_min) / (N_INTEGRATION_NODES - 1) as f64;
        let mut acc = 0.0;
        let mut prev = self.evaluate(e_min) * e_min;
        for i in 1..N_INTEGRATION_NODES {
            let e = (log_min + i as f64 * step).exp();
            let cur = self.evaluate(e) * e;
            acc += 0.5 * (prev + cur) * step;
            prev = cur;
        }
        acc
    }

    /// All parameters.
    pub fn parameters(&self) -> Vec<&Parameter> {
        match self {
            Self::PowerLaw { amplitude, index, .. } => vec![amplitude, index],
            Self::ExpCutoffPowerLaw { amplitude, index, lambda, .. } => {
                vec![amplitude, index, lambda]
            }
        }
    }

    /// All parameters, mutable.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match self {
            Self::PowerLaw { amplitude, index, .. } => vec![amplitude, index],
            Self::ExpCutoffPowerLaw { amplitude, index, lambda, .. } => {
                vec![amplitude, index, lambda]
            }
        }
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters().into_iter().find(|p| p.name() == name)
    }

    /// Look up a parameter by name, mutable.
    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters_mut().into_iter().find(|p| p.name() == name)
    }

    /// Reference energy (TeV).
    pub fn reference(&self) -> f64 {
        match self {
            Self::PowerLaw { reference, .. } | Self::ExpCutoffPowerLaw { reference, .. } => {
                *reference
            }
        }
    }
}
