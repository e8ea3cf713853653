//! Naming of parameter vectors and extraction of objective vectors.

use crate::config::MappingSection;
use crate::protocol::{Features, ParamSet};
use crate::DispatchError;

/// Translates between the Caller's positional vectors and the Engines'
/// named mappings.
///
/// # Example
///
/// ```rust
/// use tokio_eval_dispatch::map::ParamMapping;
///
/// let mapping = ParamMapping::new(
///     vec!["gnabar_hh".into(), "gkbar_hh".into()],
///     vec!["step1.Spikecount".into()],
/// );
/// let named = mapping.name_params(&[0.1, 0.03]).unwrap();
/// assert_eq!(named["gkbar_hh"], 0.03);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMapping {
    param_names: Vec<String>,
    objective_names: Vec<String>,
}

impl ParamMapping {
    /// Empty `param_names` means positional names `x0, x1, ...`; empty
    /// `objective_names` means every feature in name order.
    pub fn new(param_names: Vec<String>, objective_names: Vec<String>) -> Self {
        Self {
            param_names,
            objective_names,
        }
    }

    /// Build from `[mapping]`.
    pub fn from_config(section: &MappingSection) -> Self {
        Self::new(section.param_names.clone(), section.objective_names.clone())
    }

    /// Name each position of `values`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ParamArity`] if the vector length differs from the
    /// configured names.
    pub fn name_params(&self, values: &[f64]) -> Result<ParamSet, DispatchError> {
        if self.param_names.is_empty() {
            return Ok(values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("x{i}"), *v))
                .collect());
        }
        if values.len() != self.param_names.len() {
            return Err(DispatchError::ParamArity {
                expected: self.param_names.len(),
                actual: values.len(),
            });
        }
        Ok(self
            .param_names
            .iter()
            .cloned()
            .zip(values.iter().copied())
            .collect())
    }

    /// Pick the objective vector out of `features`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::MissingFeature`] if a configured objective is absent.
    pub fn extract_objectives(&self, features: &Features) -> Result<Vec<f64>, DispatchError> {
        if self.objective_names.is_empty() {
            return Ok(features.values().copied().collect());
        }
        self.objective_names
            .iter()
            .map(|name| {
                features
                    .get(name)
                    .copied()
                    .ok_or_else(|| DispatchError::MissingFeature {
                        feature: name.clone(),
                    })
            })
            .collect()
    }
}
