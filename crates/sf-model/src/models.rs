//! The model collection owned by a dataset.
//!
//! An explicit, order-stable collection: zero or more sky models plus at
//! most one background model. The fit engine flattens free parameters
//! across collections in attachment order, so parameter vectors are
//! reproducible run to run.

use crate::params::Parameter;
use crate::sky::{FovBackgroundModel, SkyModel};
use sf_core::{Error, Result};

/// A model component attached to a dataset.
#[derive(Debug, Clone)]
pub enum Model {
    /// A source (sky) model.
    Sky(SkyModel),
    /// The background correction model.
    FovBackground(FovBackgroundModel),
}

impl Model {
    /// Model name.
    pub fn name(&self) -> String {
        match self {
            Self::Sky(m) => m.name.clone(),
            Self::FovBackground(m) => m.name(),
        }
    }

    /// All parameters.
    pub fn parameters(&self) -> Vec<&Parameter> {
        match self {
            Self::Sky(m) => m.parameters(),
            Self::FovBackground(m) => m.parameters(),
        }
    }

    /// All parameters, mutable.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match self {
            Self::Sky(m) => m.parameters_mut(),
            Self::FovBackground(m) => m.parameters_mut(),
        }
    }
}

/// Ordered collection of model components with unique names.
#[derive(Debug, Clone, Default)]
pub struct Models {
    entries: Vec<Model>,
}

impl Models {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a component. Duplicate names and second background models are
    /// rejected.
    pub fn attach(&mut self, model: Model) -> Result<()> {
        let name = model.name();
        if self.entries.iter().any(|m| m.name() == name) {
            return Err(Error::InvalidModel(format!("duplicate model name '{name}'")));
        }
        if matches!(model, Model::FovBackground(_)) && self.background().is_some() {
            return Err(Error::InvalidModel(
                "a dataset carries at most one background model".to_string(),
            ));
        }
        self.entries.push(model);
        Ok(())
    }

    /// Detach a component by name, returning it.
    pub fn detach(&mut self, name: &str) -> Option<Model> {
        let idx = self.entries.iter().position(|m| m.name() == name)?;
        Some(self.entries.remove(idx))
    }

    /// Look up a component by name.
    pub fn get(&self, name: &str) -> Option<&Model> {
        self.entries.iter().find(|m| m.name() == name)
    }

    /// Look up a component by name, mutable.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Model> {
        self.entries.iter_mut().find(|m| m.name() == name)
    }

    /// Look up a sky model by name.
    pub fn sky_model(&self, name: &str) -> Option<&SkyModel> {
        self.entries.iter().find_map(|m| match m {
            Model::Sky(s) if s.name == name => Some(s),
            _ => None,
        })
    }

    /// Look up a sky model by name, mutable.
    pub fn sky_model_mut(&mut self, name: &str) -> Option<&mut SkyModel> {
        self.entries.iter_mut().find_map(|m| match m {
            Model::Sky(s) if s.name == name => Some(s),
            _ => None,
        })
    }

    /// Iterate over sky models in attachment order.
    pub fn sky_models(&self) -> impl Iterator<Item = &SkyModel> {
        self.entries.iter().filter_map(|m| match m {
            Model::Sky(s) => Some(s),
            _ => None,
        })
    }

    /// The background model, if attached.
    pub fn background(&self) -> Option<&FovBackgroundModel> {
        self.entries.iter().find_map(|m| match m {
            Model::FovBackground(b) => Some(b),
            _ => None,
        })
    }

    /// The background model, mutable.
    pub fn background_mut(&mut self) -> Option<&mut FovBackgroundModel> {
        self.entries.iter_mut().find_map(|m| match m {
            Model::FovBackground(b) => Some(b),
            _ => None,
        })
    }

    /// Iterate over all components in attachment order.
    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.entries.iter()
    }

    /// Iterate over all components, mutable.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Model> {
        self.entries.iter_mut()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze every parameter of every component.
    pub fn freeze_all(&mut self) {
        for model in self.iter_mut() {
            for p in model.parameters_mut() {
                p.freeze();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::SpatialModel;
    use crate::spectral::SpectralModel;

    fn sky(name: &str) -> Model {
        Model::Sky(SkyModel::new(
            name,
            SpatialModel::point(0.0, 0.0),
            SpectralModel::power_law(1e-11, 2.0, 1.0),
        ))
    }

    #[test]
    fn test_attach_detach() {
        let mut models = Models::new();
        models.attach(sky("a")).unwrap();
        models.attach(sky("b")).unwrap();
        assert!(models.attach(sky("a")).is_err());
        assert_eq!(models.len(), 2);

        let removed = models.detach("a").unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(models.len(), 1);
        assert!(models.detach("a").is_none());
    }

    #[test]
    fn test_single_background() {
        let mut models = Models::new();
        models.attach(Model::FovBackground(FovBackgroundModel::new("ds", 1.0))).unwrap();
        let err = models.attach(Model::FovBackground(FovBackgroundModel::new("ds2", 1.0)));
        assert!(err.is_err());
        assert!(models.background().is_some());
    }
}
