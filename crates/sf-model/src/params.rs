//! Model parameters.

use sf_core::{Error, Result};

/// A single model parameter: value, bounds, frozen flag, optional link key.
///
/// Two free parameters carrying the same link key are resolved to one
/// optimizer slot by the fit engine, which is how a background model is
/// shared across several datasets without a cyclic object graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: f64,
    min: f64,
    max: f64,
    frozen: bool,
    link: Option<String>,
}

impl Parameter {
    /// Create an unbounded, free parameter.
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            frozen: false,
            link: None,
        }
    }

    /// Builder: set bounds.
    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Builder: freeze the parameter.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Set the value, enforcing bounds.
    pub fn set_value(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::InvalidModel(format!(
                "parameter '{}': non-finite value {value}",
                self.name
            )));
        }
        if value < self.min || value > self.max {
            return Err(Error::InvalidModel(format!(
                "parameter '{}': value {value} outside bounds ({}, {})",
                self.name, self.min, self.max
            )));
        }
        self.value = value;
        Ok(())
    }

    /// Bounds as (min, max).
    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Whether the current value lies within bounds.
    pub fn in_bounds(&self) -> bool {
        self.value >= self.min && self.value <= self.max
    }

    /// Whether the parameter is free (not frozen).
    pub fn is_free(&self) -> bool {
        !self.frozen
    }

    /// Freeze the parameter.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Thaw the parameter.
    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    /// Link key, if any.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Link this parameter to a shared optimizer slot.
    pub fn set_link(&mut self, key: &str) {
        self.link = Some(key.to_string());
    }

    /// Remove the link.
    pub fn unlink(&mut self) {
        self.link = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_enforces_bounds() {
        let mut p = Parameter::new("norm", 1.0).with_bounds(0.0, 10.0);
        assert!(p.set_value(2.5).is_ok());
        assert_eq!(p.value(), 2.5);
        assert!(p.set_value(-1.0).is_err());
        assert!(p.set_value(f64::NAN).is_err());
        assert_eq!(p.value(), 2.5);
    }

    #[test]
    fn test_freeze_thaw() {
        let mut p = Parameter::new("index", 2.0);
        assert!(p.is_free());
        p.freeze();
        assert!(!p.is_free());
        p.thaw();
        assert!(p.is_free());
    }
}
