//! Parameters, per-alternative utilities and the identification check.

use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::data::Observation;
use crate::error::{ChoiceError, Result};
use crate::formulation::{CompiledUtility, Covariate, UtilityExpression};
use crate::table::AlternativeId;

/// Optional box constraint on a parameter; `None` on either side means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Bounds {
    /// No constraint on either side.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    /// Projects `value` onto the admissible interval.
    pub fn clamp(&self, value: f64) -> f64 {
        let value = self.lower.map_or(value, |lo| value.max(lo));
        self.upper.map_or(value, |hi| value.min(hi))
    }

    /// Whether `value` sits on one of the finite bounds (within `tolerance`).
    pub fn is_active(&self, value: f64, tolerance: f64) -> bool {
        self.lower.is_some_and(|lo| value <= lo + tolerance)
            || self.upper.is_some_and(|hi| value >= hi - tolerance)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if let (Some(lo), Some(hi)) = (self.lower, self.upper) {
            if lo > hi {
                return Err(ChoiceError::invalid_option(
                    "parameter bounds",
                    format!("`{name}` has lower bound {lo} above upper bound {hi}"),
                ));
            }
        }
        Ok(())
    }
}

/// A named scalar of the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub start_value: f64,
    pub bounds: Bounds,
    /// Fixed parameters stay at `start_value` and are excluded from the search.
    pub fixed: bool,
}

/// Outcome of [`ModelSpecification::validate_identification`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentificationDiagnostic {
    Identified,
    /// Every alternative carries a free intercept, so one of them is redundant.
    AllInterceptsFree { alternatives: Vec<AlternativeId> },
    /// The same free intercept parameter appears in every utility, which cancels in the softmax.
    SharedInterceptEverywhere { parameter: String },
}

impl IdentificationDiagnostic {
    pub fn is_identified(&self) -> bool {
        matches!(self, IdentificationDiagnostic::Identified)
    }
}

/// Parameters plus one utility expression per alternative.
///
/// ```
/// use mlogitrs::formulation::UtilityExpression;
/// use mlogitrs::model::{Bounds, ModelSpecification};
///
/// let mut spec = ModelSpecification::new();
/// spec.add_parameter("(intercept).1", 0.0, Bounds::unbounded(), true).unwrap();
/// spec.add_parameter("(intercept).2", 0.0, Bounds::unbounded(), false).unwrap();
/// spec.add_parameter("log(cost)", 0.0, Bounds::unbounded(), false).unwrap();
/// spec.set_utility(1, UtilityExpression::new().intercept("(intercept).1").cost_term("log(cost)")).unwrap();
/// spec.set_utility(2, UtilityExpression::new().intercept("(intercept).2").cost_term("log(cost)")).unwrap();
/// assert!(spec.validate_identification().is_identified());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecification {
    parameters: Vec<Parameter>,
    utilities: BTreeMap<AlternativeId, UtilityExpression>,
}

impl ModelSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a parameter. Names must be unique.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        start_value: f64,
        bounds: Bounds,
        fixed: bool,
    ) -> Result<&mut Self> {
        let name = name.into();
        if self.parameters.iter().any(|p| p.name == name) {
            return Err(ChoiceError::DuplicateName { name });
        }
        bounds.validate(&name)?;
        if !start_value.is_finite() {
            return Err(ChoiceError::invalid_option(
                "start value",
                format!("`{name}` must start at a finite value, found {start_value}"),
            ));
        }
        self.parameters.push(Parameter {
            name,
            start_value: bounds.clamp(start_value),
            bounds,
            fixed,
        });
        Ok(self)
    }

    /// Binds a utility expression to `alternative`, replacing any previous one.
    pub fn set_utility(
        &mut self,
        alternative: AlternativeId,
        expression: UtilityExpression,
    ) -> Result<&mut Self> {
        for name in expression.parameters() {
            if self.index_of(name).is_none() {
                return Err(ChoiceError::UnknownParameter {
                    alternative,
                    name: name.to_string(),
                });
            }
        }
        self.utilities.insert(alternative, expression);
        Ok(self)
    }

    /// Declared parameters in declaration order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Alternatives that carry a utility, in ascending order.
    pub fn alternatives(&self) -> impl Iterator<Item = AlternativeId> + '_ {
        self.utilities.keys().copied()
    }

    pub fn utility(&self, alternative: AlternativeId) -> Option<&UtilityExpression> {
        self.utilities.get(&alternative)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// Starting values of all parameters, fixed ones included.
    pub fn start_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.start_value).collect()
    }

    /// Positions of the free parameters in the full parameter vector.
    pub fn free_indices(&self) -> Vec<usize> {
        self.parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.fixed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Checks that the alternative-specific constants leave the model identified.
    ///
    /// This is a warning-level diagnostic: a specification can be identified through
    /// other restrictions, and the estimator re-checks the information matrix at the optimum.
    pub fn validate_identification(&self) -> IdentificationDiagnostic {
        let is_free = |name: &str| self.parameter(name).is_some_and(|p| !p.fixed);

        let diagnostic = if self.utilities.len() < 2 {
            IdentificationDiagnostic::Identified
        } else if let Some(shared) = self.shared_free_intercept(&is_free) {
            IdentificationDiagnostic::SharedInterceptEverywhere { parameter: shared }
        } else if self.utilities.values().all(|u| {
            u.intercept.as_deref().is_some_and(|name| is_free(name))
        }) {
            IdentificationDiagnostic::AllInterceptsFree {
                alternatives: self.utilities.keys().copied().collect(),
            }
        } else {
            IdentificationDiagnostic::Identified
        };

        if !diagnostic.is_identified() {
            warn!("model specification may not be identified: {diagnostic:?}");
        }
        diagnostic
    }

    fn shared_free_intercept(&self, is_free: &impl Fn(&str) -> bool) -> Option<String> {
        let mut intercepts = self.utilities.values().map(|u| u.intercept.as_deref());
        let first = intercepts.next()??;
        if is_free(first) && intercepts.all(|other| other == Some(first)) {
            Some(first.to_string())
        } else {
            None
        }
    }

    /// Evaluates the utility of `alternative` for `observation` under a full parameter vector.
    pub fn evaluate_utility(
        &self,
        alternative: AlternativeId,
        observation: &Observation,
        values: &[f64],
    ) -> Result<f64> {
        self.compile()?.utility(alternative, observation, values)
    }

    /// Resolves parameter names once so repeated evaluation avoids string lookups.
    pub fn compile(&self) -> Result<CompiledModel> {
        let positions: HashMap<&str, usize> = self
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();
        let lookup = |alternative: AlternativeId, name: &str| {
            positions
                .get(name)
                .copied()
                .ok_or_else(|| ChoiceError::UnknownParameter {
                    alternative,
                    name: name.to_string(),
                })
        };

        let mut utilities = Vec::with_capacity(self.utilities.len());
        for (alternative, expression) in &self.utilities {
            let intercept = match &expression.intercept {
                Some(name) => Some(lookup(*alternative, name)?),
                None => None,
            };
            let mut terms = Vec::with_capacity(expression.terms.len());
            for term in &expression.terms {
                terms.push((lookup(*alternative, &term.parameter)?, term.covariate.clone()));
            }
            utilities.push((*alternative, CompiledUtility { intercept, terms }));
        }
        Ok(CompiledModel {
            utilities,
            parameter_count: self.parameters.len(),
        })
    }
}

/// A [`ModelSpecification`] with parameter names resolved to vector positions.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledModel {
    utilities: Vec<(AlternativeId, CompiledUtility)>,
    parameter_count: usize,
}

impl CompiledModel {
    /// Number of entries in the full parameter vector.
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Alternatives in ascending order.
    pub fn alternatives(&self) -> impl Iterator<Item = AlternativeId> + '_ {
        self.utilities.iter().map(|(a, _)| *a)
    }

    /// Utility of `alternative` for `observation`.
    pub fn utility(
        &self,
        alternative: AlternativeId,
        observation: &Observation,
        values: &[f64],
    ) -> Result<f64> {
        self.check_length(values.len())?;
        let compiled = self.compiled(alternative)?;
        compiled
            .evaluate(alternative, observation, values)
            .ok_or_else(|| self.missing_covariate(compiled, alternative, observation))
    }

    /// Adds `scale * ∂V_alternative/∂θ` to `gradient`, a slice over the full parameter vector.
    pub(crate) fn add_utility_gradient(
        &self,
        alternative: AlternativeId,
        observation: &Observation,
        scale: f64,
        gradient: &mut [f64],
    ) -> Result<()> {
        self.check_length(gradient.len())?;
        let compiled = self.compiled(alternative)?;
        compiled
            .add_gradient(alternative, observation, scale, gradient)
            .ok_or_else(|| self.missing_covariate(compiled, alternative, observation))
    }

    fn compiled(&self, alternative: AlternativeId) -> Result<&CompiledUtility> {
        self.utilities
            .iter()
            .find(|(a, _)| *a == alternative)
            .map(|(_, compiled)| compiled)
            .ok_or(ChoiceError::UnknownAlternative { alternative })
    }

    fn check_length(&self, found: usize) -> Result<()> {
        if found != self.parameter_count {
            return Err(ChoiceError::dimension_mismatch(
                "parameter values",
                self.parameter_count,
                found,
            ));
        }
        Ok(())
    }

    /// Calls `visit(alternative, utility)` for every available alternative of `observation`.
    pub(crate) fn for_each_available(
        &self,
        observation: &Observation,
        values: &[f64],
        mut visit: impl FnMut(AlternativeId, f64),
    ) -> Result<()> {
        for (alternative, compiled) in &self.utilities {
            if !observation.is_available(*alternative) {
                continue;
            }
            let utility = compiled
                .evaluate(*alternative, observation, values)
                .ok_or_else(|| self.missing_covariate(compiled, *alternative, observation))?;
            visit(*alternative, utility);
        }
        Ok(())
    }

    fn missing_covariate(
        &self,
        compiled: &CompiledUtility,
        alternative: AlternativeId,
        observation: &Observation,
    ) -> ChoiceError {
        let column = compiled
            .terms
            .iter()
            .find(|(_, c)| c.resolve(alternative, observation).is_none())
            .map(|(_, c)| match c {
                Covariate::Column(name) => name.clone(),
                other => format!("{other:?}"),
            })
            .unwrap_or_default();
        ChoiceError::MissingCovariate {
            column,
            row: observation.row,
        }
    }
}
