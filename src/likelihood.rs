//! Conditional logit probabilities and the weighted log-likelihood.
//!
//! Probabilities are computed over available alternatives only, in log space and after
//! subtracting the largest available utility, so large log-costs never overflow `exp`.

use crate::data::{ChoiceData, Observation};
use crate::error::{ChoiceError, Result};
use crate::model::CompiledModel;
use crate::table::AlternativeId;

/// Log of the normalizing sum `ln Σ exp(v)` over the given utilities, or `None` if empty.
pub fn log_sum_exp(utilities: &[f64]) -> Option<f64> {
    let max = utilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if utilities.is_empty() {
        return None;
    }
    if !max.is_finite() {
        return Some(max);
    }
    let sum: f64 = utilities.iter().map(|v| (v - max).exp()).sum();
    Some(max + sum.ln())
}

fn available_utilities(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<Vec<(AlternativeId, f64)>> {
    if values.len() != model.parameter_count() {
        return Err(ChoiceError::dimension_mismatch(
            "parameter values",
            model.parameter_count(),
            values.len(),
        ));
    }
    let mut utilities = Vec::with_capacity(4);
    model.for_each_available(observation, values, |alternative, utility| {
        utilities.push((alternative, utility));
    })?;
    Ok(utilities)
}

/// Probability of every available alternative of `observation`, in ascending alternative order.
///
/// Unavailable alternatives are omitted. The probabilities sum to one whenever the utilities are finite.
pub fn choice_probabilities(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<Vec<(AlternativeId, f64)>> {
    let utilities = available_utilities(model, observation, values)?;
    let raw: Vec<f64> = utilities.iter().map(|(_, v)| *v).collect();
    let Some(log_denominator) = log_sum_exp(&raw) else {
        return Ok(Vec::new());
    };
    Ok(utilities
        .into_iter()
        .map(|(alternative, v)| (alternative, (v - log_denominator).exp()))
        .collect())
}

/// Log-probability of the chosen alternative.
///
/// Returns `-inf` when the chosen alternative is unavailable and NaN when utilities are not finite;
/// callers decide how to report such values.
pub fn log_choice_probability(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<f64> {
    let utilities = available_utilities(model, observation, values)?;
    let Some(chosen) = utilities
        .iter()
        .find(|(alternative, _)| *alternative == observation.chosen)
        .map(|(_, v)| *v)
    else {
        return Ok(f64::NEG_INFINITY);
    };
    let raw: Vec<f64> = utilities.iter().map(|(_, v)| *v).collect();
    match log_sum_exp(&raw) {
        Some(log_denominator) if log_denominator.is_finite() => Ok(chosen - log_denominator),
        _ => Ok(f64::NAN),
    }
}

/// `P(chosen) = exp(V_chosen) / Σ_available exp(V_a)`.
pub fn choice_probability(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<f64> {
    Ok(log_choice_probability(model, observation, values)?.exp())
}

/// `weight * ln P(chosen)`. Observations with zero weight contribute exactly zero.
pub fn log_likelihood_contribution(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<f64> {
    if observation.weight == 0.0 {
        return Ok(0.0);
    }
    Ok(observation.weight * log_choice_probability(model, observation, values)?)
}

/// Weighted log-likelihood of a group together with the first row that was not finite.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LikelihoodEvaluation {
    pub value: f64,
    /// Row of the first observation whose contribution was NaN or infinite.
    pub non_finite_row: Option<usize>,
}

impl LikelihoodEvaluation {
    /// Whether every contribution was finite.
    pub fn is_finite(&self) -> bool {
        self.non_finite_row.is_none() && self.value.is_finite()
    }
}

/// Weighted sum of the contributions of every observation.
pub fn aggregate_log_likelihood(
    model: &CompiledModel,
    data: &ChoiceData,
    values: &[f64],
) -> Result<LikelihoodEvaluation> {
    let mut value = 0.0;
    let mut non_finite_row = None;
    for observation in data.observations() {
        let contribution = log_likelihood_contribution(model, observation, values)?;
        if !contribution.is_finite() && non_finite_row.is_none() {
            non_finite_row = Some(observation.row);
        }
        value += contribution;
    }
    Ok(LikelihoodEvaluation {
        value,
        non_finite_row,
    })
}

/// Per-observation contributions, in data order.
pub fn contributions(model: &CompiledModel, data: &ChoiceData, values: &[f64]) -> Result<Vec<f64>> {
    data.observations()
        .iter()
        .map(|observation| log_likelihood_contribution(model, observation, values))
        .collect()
}

/// Gradient of `weight * ln P(chosen)` with respect to the full parameter vector.
///
/// With linear utilities the score is `w (∂V_chosen/∂θ - Σ_a P_a ∂V_a/∂θ)`, the derivatives
/// being read off the declared expressions.
pub fn score_contribution(
    model: &CompiledModel,
    observation: &Observation,
    values: &[f64],
) -> Result<Vec<f64>> {
    let probabilities = choice_probabilities(model, observation, values)?;
    let mut score = vec![0.0; values.len()];
    if observation.weight == 0.0 {
        return Ok(score);
    }
    model.add_utility_gradient(observation.chosen, observation, observation.weight, &mut score)?;
    for (alternative, probability) in probabilities {
        model.add_utility_gradient(
            alternative,
            observation,
            -observation.weight * probability,
            &mut score,
        )?;
    }
    Ok(score)
}

/// Per-observation scores, in data order.
pub fn scores(model: &CompiledModel, data: &ChoiceData, values: &[f64]) -> Result<Vec<Vec<f64>>> {
    data.observations()
        .iter()
        .map(|observation| score_contribution(model, observation, values))
        .collect()
}

/// Gradient of the aggregate weighted log-likelihood.
pub fn aggregate_score(model: &CompiledModel, data: &ChoiceData, values: &[f64]) -> Result<Vec<f64>> {
    let mut total = vec![0.0; values.len()];
    for observation in data.observations() {
        let score = score_contribution(model, observation, values)?;
        for (sum, component) in total.iter_mut().zip(score) {
            *sum += component;
        }
    }
    Ok(total)
}

/// Log-likelihood of the model with every utility at zero (equal shares over available alternatives).
pub fn null_log_likelihood(model: &CompiledModel, data: &ChoiceData) -> f64 {
    data.observations()
        .iter()
        .filter(|o| o.weight != 0.0)
        .map(|observation| {
            let available = model
                .alternatives()
                .filter(|a| observation.is_available(*a))
                .count();
            if available == 0 {
                f64::NEG_INFINITY
            } else {
                -observation.weight * (available as f64).ln()
            }
        })
        .sum()
}
