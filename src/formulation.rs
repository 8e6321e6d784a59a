//! Linear-in-parameters utility expressions.
//!
//! A utility is an optional intercept parameter plus a list of `parameter × covariate`
//! terms. Covariates are resolved against an [`Observation`] by explicit accessors, so
//! expressions are plain data: they can be serialized, compared and tested on their own.

use serde::{Deserialize, Serialize};

use crate::data::Observation;
use crate::table::AlternativeId;

/// Where the value multiplying a parameter comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Covariate {
    /// The (transformed) cost of the alternative the expression belongs to.
    OwnCost,
    /// The (transformed) cost of a specific alternative.
    Cost(AlternativeId),
    /// Any numeric column of the observation, by lowercase name.
    Column(String),
    /// A fixed number, e.g. a dummy set to one.
    Constant(f64),
}

impl Covariate {
    /// Resolves the covariate for `observation`; `None` when the column is absent.
    pub fn resolve(&self, alternative: AlternativeId, observation: &Observation) -> Option<f64> {
        match self {
            Covariate::OwnCost => observation.cost(alternative),
            Covariate::Cost(other) => observation.cost(*other),
            Covariate::Column(name) => observation.covariate(name),
            Covariate::Constant(value) => Some(*value),
        }
    }
}

/// One `parameter × covariate` product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub parameter: String,
    pub covariate: Covariate,
}

/// Utility of one alternative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilityExpression {
    /// Alternative-specific constant, if any.
    pub intercept: Option<String>,
    pub terms: Vec<Term>,
}

impl UtilityExpression {
    /// Empty expression (utility identically zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the alternative-specific constant.
    pub fn intercept<S: Into<String>>(mut self, parameter: S) -> Self {
        self.intercept = Some(parameter.into());
        self
    }

    /// Adds a `parameter × covariate` term.
    pub fn term<S: Into<String>>(mut self, parameter: S, covariate: Covariate) -> Self {
        self.terms.push(Term {
            parameter: parameter.into(),
            covariate,
        });
        self
    }

    /// Shorthand for a term multiplying the alternative's own cost.
    pub fn cost_term<S: Into<String>>(self, parameter: S) -> Self {
        self.term(parameter, Covariate::OwnCost)
    }

    /// Every parameter name the expression refers to, intercept first.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.intercept
            .iter()
            .map(String::as_str)
            .chain(self.terms.iter().map(|t| t.parameter.as_str()))
    }
}

/// An expression whose parameter names were resolved to positions in a parameter vector.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CompiledUtility {
    pub(crate) intercept: Option<usize>,
    pub(crate) terms: Vec<(usize, Covariate)>,
}

impl CompiledUtility {
    /// Evaluates the utility; `None` when a covariate cannot be resolved.
    pub(crate) fn evaluate(
        &self,
        alternative: AlternativeId,
        observation: &Observation,
        values: &[f64],
    ) -> Option<f64> {
        let mut utility = self.intercept.map_or(0.0, |index| values[index]);
        for (index, covariate) in &self.terms {
            utility += values[*index] * covariate.resolve(alternative, observation)?;
        }
        Some(utility)
    }

    /// Adds `scale * ∂V/∂θ` to `gradient`; `None` when a covariate cannot be resolved.
    ///
    /// Utilities are linear in the parameters, so the derivative with respect to a parameter is
    /// one for an intercept and the resolved covariate for a term.
    pub(crate) fn add_gradient(
        &self,
        alternative: AlternativeId,
        observation: &Observation,
        scale: f64,
        gradient: &mut [f64],
    ) -> Option<()> {
        if let Some(index) = self.intercept {
            gradient[index] += scale;
        }
        for (index, covariate) in &self.terms {
            gradient[*index] += scale * covariate.resolve(alternative, observation)?;
        }
        Some(())
    }
}
