//! Weighted maximum-likelihood estimation of a conditional logit model.

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::data::ChoiceData;
use crate::error::{ChoiceError, Result};
use crate::likelihood::{aggregate_log_likelihood, aggregate_score, null_log_likelihood, scores};
use crate::model::{CompiledModel, ModelSpecification};
use crate::options::{CovarianceKind, EstimationOptions, OptimizerMethod};
use crate::solving::{Bfgs, Minimizer, NewtonRaphson, Objective, SolverStatus, SolverSummary};

/// Terminal status of an estimation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    Converged,
    /// The iteration budget ran out; estimates are the best point found so far.
    MaxIterations,
    /// A likelihood evaluation was not finite or no descent step could be found.
    NumericalFailure { reason: String },
    Cancelled,
}

impl From<SolverStatus> for ConvergenceStatus {
    fn from(status: SolverStatus) -> Self {
        match status {
            SolverStatus::Converged => ConvergenceStatus::Converged,
            SolverStatus::MaxIterations => ConvergenceStatus::MaxIterations,
            SolverStatus::NumericalFailure { reason } => {
                ConvergenceStatus::NumericalFailure { reason }
            }
            SolverStatus::Cancelled => ConvergenceStatus::Cancelled,
        }
    }
}

/// Lifecycle of an [`Estimator`].
#[derive(Clone, Debug, PartialEq)]
pub enum EstimatorState {
    Initialized,
    Optimizing,
    Finished(ConvergenceStatus),
}

/// How parameter bounds were enforced during the search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundHandling {
    /// Iterates are projected onto the bounds; parameters on a bound are flagged `at_bound`.
    Projection,
}

/// Whether the information matrix could be inverted at the optimum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InformationStatus {
    Invertible { condition_number: f64 },
    /// Standard errors are undefined; the model is probably not identified.
    Singular { smallest_eigenvalue: f64 },
    /// No free parameters, or the optimizer stopped without converging, so the point is not an optimum.
    NotComputed,
}

/// Estimate and precision of one parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    pub name: String,
    pub estimate: f64,
    /// `None` when the parameter is fixed or the information matrix is singular.
    pub std_error: Option<f64>,
    pub t_statistic: Option<f64>,
    /// Two-sided p-value of the t-test against zero.
    pub p_value: Option<f64>,
    /// Sandwich standard error, also reported when `std_error` comes from the observed information.
    pub robust_std_error: Option<f64>,
    pub fixed: bool,
    pub at_bound: bool,
}

/// Outcome of an estimation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    /// All parameters in declaration order, fixed ones included.
    pub parameters: Vec<ParameterEstimate>,
    pub log_likelihood: f64,
    /// Log-likelihood at the starting values.
    pub initial_log_likelihood: f64,
    /// Log-likelihood with every utility at zero.
    pub null_log_likelihood: f64,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    /// Relative projected gradient at the returned point.
    pub gradient_norm: f64,
    pub information: InformationStatus,
    pub covariance_kind: CovarianceKind,
    /// Covariance of the free parameters selected by `covariance_kind`.
    pub covariance: Option<DMatrix<f64>>,
    pub bound_handling: BoundHandling,
    pub sample_size: usize,
}

impl EstimationResult {
    pub fn is_converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }

    /// Estimate of a parameter by name.
    pub fn get(&self, name: &str) -> Option<&ParameterEstimate> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Full parameter vector in declaration order.
    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.estimate).collect()
    }

    /// Estimated (free) parameters as `(name, value)` pairs.
    pub fn beta_values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.parameters
            .iter()
            .filter(|p| !p.fixed)
            .map(|p| (p.name.as_str(), p.estimate))
    }

    pub fn free_parameter_count(&self) -> usize {
        self.parameters.iter().filter(|p| !p.fixed).count()
    }

    /// Likelihood-ratio statistic against the null model, `-2 (LL0 - LL)`.
    pub fn likelihood_ratio(&self) -> f64 {
        -2.0 * (self.null_log_likelihood - self.log_likelihood)
    }

    /// `1 - LL / LL0`.
    pub fn rho_square(&self) -> f64 {
        1.0 - self.log_likelihood / self.null_log_likelihood
    }

    /// `1 - (LL - K) / LL0` with `K` free parameters.
    pub fn rho_bar_square(&self) -> f64 {
        1.0 - (self.log_likelihood - self.free_parameter_count() as f64) / self.null_log_likelihood
    }

    pub fn aic(&self) -> f64 {
        2.0 * self.free_parameter_count() as f64 - 2.0 * self.log_likelihood
    }

    pub fn bic(&self) -> f64 {
        self.free_parameter_count() as f64 * (self.sample_size as f64).ln()
            - 2.0 * self.log_likelihood
    }
}

/// Negative weighted log-likelihood over the free parameters.
struct NegativeLogLikelihood<'a> {
    model: &'a CompiledModel,
    data: &'a ChoiceData,
    template: Vec<f64>,
    free: &'a [usize],
}

impl NegativeLogLikelihood<'_> {
    fn full(&self, free_values: &DVector<f64>) -> Vec<f64> {
        let mut values = self.template.clone();
        for (slot, value) in self.free.iter().zip(free_values.iter()) {
            values[*slot] = *value;
        }
        values
    }

    /// Per-observation scores of the log-likelihood over the free parameters, one row per observation.
    fn score_matrix(&self, free_values: &DVector<f64>) -> Option<DMatrix<f64>> {
        let rows = scores(self.model, self.data, &self.full(free_values)).ok()?;
        Some(DMatrix::from_fn(rows.len(), self.free.len(), |r, c| {
            rows[r][self.free[c]]
        }))
    }
}

impl Objective for NegativeLogLikelihood<'_> {
    fn value(&self, x: &DVector<f64>) -> f64 {
        match aggregate_log_likelihood(self.model, self.data, &self.full(x)) {
            Ok(evaluation) if evaluation.is_finite() => -evaluation.value,
            _ => f64::NAN,
        }
    }

    fn gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        match aggregate_score(self.model, self.data, &self.full(x)) {
            Ok(score) => DVector::from_iterator(
                self.free.len(),
                self.free.iter().map(|slot| -score[*slot]),
            ),
            Err(_) => DVector::from_element(self.free.len(), f64::NAN),
        }
    }
}

/// Drives one estimation run and records where it is in its lifecycle.
#[derive(Clone, Debug)]
pub struct Estimator {
    options: EstimationOptions,
    state: EstimatorState,
}

impl Estimator {
    pub fn new(options: EstimationOptions) -> Self {
        Self {
            options,
            state: EstimatorState::Initialized,
        }
    }

    pub fn state(&self) -> &EstimatorState {
        &self.state
    }

    pub fn options(&self) -> &EstimationOptions {
        &self.options
    }

    /// Fits the free parameters of `spec` to `data`.
    ///
    /// Data and specification problems are returned as errors before any optimization.
    /// Optimization problems are reported through [`EstimationResult::status`] with the
    /// best point found.
    pub fn estimate(
        &mut self,
        spec: &ModelSpecification,
        data: &ChoiceData,
    ) -> Result<EstimationResult> {
        self.options.validate()?;
        if data.is_empty() {
            return Err(ChoiceError::dimension_mismatch("observations", 1, 0));
        }
        let model = spec.compile()?;
        for observation in data.observations() {
            if spec.utility(observation.chosen).is_none() {
                return Err(ChoiceError::UnknownAlternative {
                    alternative: observation.chosen,
                });
            }
            if !observation.is_available(observation.chosen) {
                return Err(ChoiceError::ChosenUnavailable {
                    row: observation.row,
                    alternative: observation.chosen,
                });
            }
        }
        let identification = spec.validate_identification();
        if !identification.is_identified() && self.options.strict_identification {
            return Err(ChoiceError::Identification {
                reason: format!("{identification:?}"),
            });
        }

        let free = spec.free_indices();
        let template = spec.start_values();
        let bounds: Vec<_> = free.iter().map(|i| spec.parameters()[*i].bounds).collect();
        let objective = NegativeLogLikelihood {
            model: &model,
            data,
            template: template.clone(),
            free: &free,
        };
        let start = DVector::from_iterator(free.len(), free.iter().map(|i| template[*i]));
        let initial = aggregate_log_likelihood(&model, data, &template)?;
        let null = null_log_likelihood(&model, data);

        info!(
            "estimating {} free parameters on {} observations (initial log-likelihood {:.6})",
            free.len(),
            data.len(),
            initial.value
        );
        self.state = EstimatorState::Optimizing;

        let (optimum, summary) = if free.is_empty() {
            let status = if initial.is_finite() {
                SolverStatus::Converged
            } else {
                SolverStatus::NumericalFailure {
                    reason: "log-likelihood is not finite at the fixed values".to_string(),
                }
            };
            (
                start.clone(),
                SolverSummary {
                    status,
                    iterations: 0,
                    value: -initial.value,
                    gradient_norm: 0.0,
                },
            )
        } else {
            let solver_options = self.options.solver_options();
            match self.options.method {
                OptimizerMethod::Bfgs => Bfgs.minimize(&objective, &start, &bounds, &solver_options),
                OptimizerMethod::NewtonRaphson => {
                    NewtonRaphson.minimize(&objective, &start, &bounds, &solver_options)
                }
            }
        };

        let status = ConvergenceStatus::from(summary.status.clone());
        match &status {
            ConvergenceStatus::Converged => info!(
                "converged after {} iterations, log-likelihood {:.6}",
                summary.iterations, -summary.value
            ),
            other => warn!(
                "estimation stopped after {} iterations: {other:?}",
                summary.iterations
            ),
        }

        let values = objective.full(&optimum);
        let log_likelihood = aggregate_log_likelihood(&model, data, &values)?.value;

        // Curvature away from a stationary point does not describe the sampling variance.
        let precision = if free.is_empty() || status != ConvergenceStatus::Converged {
            Precision::not_computed(free.len())
        } else {
            self.precision(&objective, &optimum)
        };
        if let InformationStatus::Singular { smallest_eigenvalue } = precision.information {
            warn!(
                "information matrix is singular (smallest eigenvalue {smallest_eigenvalue:e}); standard errors are undefined"
            );
        }

        let normal = Normal::new(0.0, 1.0).map_err(|_| ChoiceError::NumericalError {
            context: "standard normal construction",
        })?;
        let mut parameters = Vec::with_capacity(spec.parameters().len());
        for (index, parameter) in spec.parameters().iter().enumerate() {
            let estimate = values[index];
            let position = free.iter().position(|slot| *slot == index);
            let std_error = position.and_then(|p| precision.selected[p]);
            let t_statistic = std_error.map(|se| estimate / se);
            parameters.push(ParameterEstimate {
                name: parameter.name.clone(),
                estimate,
                std_error,
                t_statistic,
                p_value: t_statistic.map(|t| 2.0 * (1.0 - normal.cdf(t.abs()))),
                robust_std_error: position.and_then(|p| precision.robust[p]),
                fixed: parameter.fixed,
                at_bound: !parameter.fixed && parameter.bounds.is_active(estimate, 1e-12),
            });
        }

        self.state = EstimatorState::Finished(status.clone());
        Ok(EstimationResult {
            parameters,
            log_likelihood,
            initial_log_likelihood: initial.value,
            null_log_likelihood: null,
            status,
            iterations: summary.iterations,
            gradient_norm: summary.gradient_norm,
            information: precision.information,
            covariance_kind: self.options.covariance,
            covariance: precision.covariance,
            bound_handling: BoundHandling::Projection,
            sample_size: data.len(),
        })
    }

    /// Observed and robust covariance at the optimum.
    fn precision(&self, objective: &NegativeLogLikelihood<'_>, optimum: &DVector<f64>) -> Precision {
        let k = optimum.len();
        // The objective is the negative log-likelihood, so its Hessian is the observed information.
        let information = objective.hessian(optimum);
        if information.iter().any(|v| !v.is_finite()) {
            return Precision::singular(k, f64::NAN);
        }

        let eigen = information.clone().symmetric_eigen();
        let smallest = eigen.eigenvalues.min();
        let largest = eigen.eigenvalues.amax();
        if smallest <= self.options.singularity_tolerance * largest.max(f64::MIN_POSITIVE) {
            return Precision::singular(k, smallest);
        }
        let Some(observed) = information.clone().try_inverse() else {
            return Precision::singular(k, smallest);
        };

        let robust = match objective.score_matrix(optimum) {
            Some(scores) => &observed * (scores.transpose() * &scores) * &observed,
            None => DMatrix::from_element(k, k, f64::NAN),
        };

        let diagonal_se = |m: &DMatrix<f64>| -> Vec<Option<f64>> {
            (0..k)
                .map(|i| {
                    let variance = m[(i, i)];
                    (variance.is_finite() && variance > 0.0).then(|| variance.sqrt())
                })
                .collect()
        };
        let observed_se = diagonal_se(&observed);
        let robust_se = diagonal_se(&robust);
        let (selected, covariance) = match self.options.covariance {
            CovarianceKind::Observed => (observed_se, observed),
            CovarianceKind::Robust => (robust_se.clone(), robust),
        };
        Precision {
            selected,
            robust: robust_se,
            covariance: Some(covariance),
            information: InformationStatus::Invertible {
                condition_number: largest / smallest,
            },
        }
    }
}

struct Precision {
    selected: Vec<Option<f64>>,
    robust: Vec<Option<f64>>,
    covariance: Option<DMatrix<f64>>,
    information: InformationStatus,
}

impl Precision {
    fn not_computed(k: usize) -> Self {
        Self {
            selected: vec![None; k],
            robust: vec![None; k],
            covariance: None,
            information: InformationStatus::NotComputed,
        }
    }

    fn singular(k: usize, smallest_eigenvalue: f64) -> Self {
        Self {
            information: InformationStatus::Singular {
                smallest_eigenvalue,
            },
            ..Self::not_computed(k)
        }
    }
}

/// Convenience wrapper around [`Estimator::estimate`].
pub fn estimate(
    spec: &ModelSpecification,
    data: &ChoiceData,
    options: &EstimationOptions,
) -> Result<EstimationResult> {
    Estimator::new(options.clone()).estimate(spec, data)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use approx::assert_relative_eq;

    use super::*;
    use crate::data::Observation;
    use crate::formulation::UtilityExpression;
    use crate::model::Bounds;
    use crate::solving::CancellationToken;

    fn binary_data(choices: &[(u32, f64)]) -> ChoiceData {
        let observations = choices
            .iter()
            .enumerate()
            .map(|(row, (chosen, weight))| Observation {
                row,
                costs: BTreeMap::from([(1, 0.0), (2, 0.0)]),
                availability: BTreeMap::from([(1, true), (2, true)]),
                chosen: *chosen,
                quantity: *weight,
                weight: *weight,
                covariates: HashMap::new(),
            })
            .collect();
        ChoiceData::new(vec![1, 2], observations).unwrap()
    }

    fn binary_spec(fix_reference: bool) -> ModelSpecification {
        let mut spec = ModelSpecification::new();
        spec.add_parameter("asc1", 0.0, Bounds::unbounded(), fix_reference)
            .unwrap()
            .add_parameter("asc2", 0.0, Bounds::unbounded(), false)
            .unwrap();
        spec.set_utility(1, UtilityExpression::new().intercept("asc1"))
            .unwrap()
            .set_utility(2, UtilityExpression::new().intercept("asc2"))
            .unwrap();
        spec
    }

    #[test]
    fn weighted_intercept_matches_closed_form() {
        // Weighted shares: alternative 1 carries 3.0, alternative 2 carries 1.0.
        let data = binary_data(&[(1, 1.5), (1, 1.5), (2, 0.5), (2, 0.5)]);
        let mut estimator = Estimator::new(EstimationOptions::default());
        assert_eq!(estimator.state(), &EstimatorState::Initialized);
        let result = estimator.estimate(&binary_spec(true), &data).unwrap();

        assert!(result.is_converged());
        assert_eq!(estimator.state(), &EstimatorState::Finished(ConvergenceStatus::Converged));
        let asc2 = result.get("asc2").unwrap();
        assert_relative_eq!(asc2.estimate, (1.0_f64 / 3.0).ln(), epsilon = 1e-5);

        // Observed information for a binary logit intercept: W p (1 - p).
        let p: f64 = 0.25;
        let expected_se = 1.0 / (4.0 * p * (1.0 - p)).sqrt();
        assert_relative_eq!(asc2.std_error.unwrap(), expected_se, epsilon = 1e-4);
        assert!(result.get("asc1").unwrap().std_error.is_none());
        assert!(result.log_likelihood > result.null_log_likelihood);
        assert!(result.rho_square() > 0.0);
    }

    #[test]
    fn newton_raphson_agrees_with_bfgs() {
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0)]);
        let spec = binary_spec(true);
        let bfgs = estimate(&spec, &data, &EstimationOptions::default()).unwrap();
        let newton = estimate(
            &spec,
            &data,
            &EstimationOptions::default().with_method(OptimizerMethod::NewtonRaphson),
        )
        .unwrap();
        assert!(newton.is_converged());
        assert_relative_eq!(
            bfgs.get("asc2").unwrap().estimate,
            newton.get("asc2").unwrap().estimate,
            epsilon = 1e-5
        );
        assert_relative_eq!(newton.get("asc2").unwrap().estimate, 2.0_f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn unidentified_model_reports_undefined_errors() {
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0)]);
        let result = estimate(&binary_spec(false), &data, &EstimationOptions::default()).unwrap();
        assert!(matches!(result.information, InformationStatus::Singular { .. }));
        assert!(result.parameters.iter().all(|p| p.std_error.is_none()));
        assert!(result.covariance.is_none());

        let strict = EstimationOptions::default().with_strict_identification(true);
        assert!(matches!(
            estimate(&binary_spec(false), &data, &strict),
            Err(ChoiceError::Identification { .. })
        ));
    }

    #[test]
    fn all_fixed_parameters_return_fixed_likelihood() {
        let mut spec = ModelSpecification::new();
        spec.add_parameter("asc1", 0.0, Bounds::unbounded(), true)
            .unwrap()
            .add_parameter("asc2", 1.0, Bounds::unbounded(), true)
            .unwrap();
        spec.set_utility(1, UtilityExpression::new().intercept("asc1"))
            .unwrap()
            .set_utility(2, UtilityExpression::new().intercept("asc2"))
            .unwrap();
        let data = binary_data(&[(2, 1.0)]);
        let result = estimate(&spec, &data, &EstimationOptions::default()).unwrap();
        assert!(result.is_converged());
        assert_eq!(result.iterations, 0);
        let expected = -(1.0 + (-1.0_f64).exp()).ln();
        assert_relative_eq!(result.log_likelihood, expected, epsilon = 1e-12);
        assert_eq!(result.information, InformationStatus::NotComputed);
    }

    #[test]
    fn exhausted_iteration_budget_leaves_precision_uncomputed() {
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0)]);
        let options = EstimationOptions::default().with_max_iterations(1);
        let result = estimate(&binary_spec(true), &data, &options).unwrap();
        assert_eq!(result.status, ConvergenceStatus::MaxIterations);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.information, InformationStatus::NotComputed);
        assert!(result.covariance.is_none());
        let asc2 = result.get("asc2").unwrap();
        assert!(asc2.estimate > 0.0 && asc2.estimate < 2.0_f64.ln() + 0.5);
        assert!(asc2.std_error.is_none());
        assert!(asc2.robust_std_error.is_none());
        assert!(asc2.p_value.is_none());
        assert!(result.log_likelihood > result.initial_log_likelihood);
    }

    #[test]
    fn robust_errors_match_observed_ones_for_a_saturated_model() {
        // With one free intercept the sandwich collapses to the observed information.
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0), (1, 1.0), (2, 1.0)]);
        let result = estimate(&binary_spec(true), &data, &EstimationOptions::default()).unwrap();
        let asc2 = result.get("asc2").unwrap();
        assert!(result.is_converged());
        assert_relative_eq!(
            asc2.std_error.unwrap(),
            asc2.robust_std_error.unwrap(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn cancelled_run_has_distinct_status() {
        let token = CancellationToken::new();
        token.cancel();
        let options = EstimationOptions::default().with_cancellation(token);
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0)]);
        let result = estimate(&binary_spec(true), &data, &options).unwrap();
        assert_eq!(result.status, ConvergenceStatus::Cancelled);
        assert_eq!(result.get("asc2").unwrap().estimate, 0.0);
        assert!(result.get("asc2").unwrap().std_error.is_none());
    }

    #[test]
    fn bounded_parameter_stops_on_its_bound() {
        let mut spec = ModelSpecification::new();
        spec.add_parameter("asc1", 0.0, Bounds::unbounded(), true)
            .unwrap()
            .add_parameter("asc2", 0.0, Bounds::new(None, Some(0.2)), false)
            .unwrap();
        spec.set_utility(1, UtilityExpression::new().intercept("asc1"))
            .unwrap()
            .set_utility(2, UtilityExpression::new().intercept("asc2"))
            .unwrap();
        // Unconstrained optimum is ln 2 > 0.2.
        let data = binary_data(&[(1, 1.0), (2, 1.0), (2, 1.0)]);
        let result = estimate(&spec, &data, &EstimationOptions::default()).unwrap();
        assert!(result.is_converged());
        let asc2 = result.get("asc2").unwrap();
        assert_relative_eq!(asc2.estimate, 0.2);
        assert!(asc2.at_bound);
        assert_eq!(result.bound_handling, BoundHandling::Projection);
    }
}
