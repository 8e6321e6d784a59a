//! Configuration structures for estimation runs.

use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};
use crate::solving::{CancellationToken, SolverOptions};

/// Optimization strategy used to maximize the log-likelihood.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerMethod {
    /// BFGS quasi-Newton.
    #[default]
    Bfgs,
    /// Newton-CG on the Hessian, a finite difference of the analytic score.
    NewtonRaphson,
}

/// Which covariance estimate drives the reported standard errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceKind {
    /// Inverse of the observed information (negative Hessian).
    #[default]
    Observed,
    /// Sandwich estimator `A⁻¹ B A⁻¹` with `B` the outer product of per-observation scores.
    Robust,
}

/// Controls a single estimation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimationOptions {
    /// Maximum number of optimizer iterations.
    pub max_iterations: usize,
    /// Threshold on the relative projected gradient at which the fit is considered converged.
    pub gradient_tolerance: f64,
    /// Length of the first BFGS step.
    pub initial_step_size: f64,
    pub method: OptimizerMethod,
    pub covariance: CovarianceKind,
    /// Smallest admissible ratio between the smallest and largest eigenvalue of the information matrix.
    pub singularity_tolerance: f64,
    /// Turn identification warnings into [`ChoiceError::Identification`].
    pub strict_identification: bool,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            gradient_tolerance: 1e-6,
            initial_step_size: 1.0,
            method: OptimizerMethod::Bfgs,
            covariance: CovarianceKind::Observed,
            singularity_tolerance: 1e-7,
            strict_identification: false,
            cancellation: None,
        }
    }
}

impl EstimationOptions {
    /// Set the maximum number of optimizer iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the convergence threshold on the relative gradient.
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    /// Set the length of the first BFGS step.
    pub fn with_initial_step_size(mut self, step: f64) -> Self {
        self.initial_step_size = step;
        self
    }

    pub fn with_method(mut self, method: OptimizerMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_covariance(mut self, covariance: CovarianceKind) -> Self {
        self.covariance = covariance;
        self
    }

    /// Fail instead of warning when the specification looks unidentified.
    pub fn with_strict_identification(mut self, strict: bool) -> Self {
        self.strict_identification = strict;
        self
    }

    /// Attach a token that can stop the run between iterations.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Rejects values no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ChoiceError::invalid_option(
                "max_iterations",
                "must be greater than zero",
            ));
        }
        for (option, value) in [
            ("gradient_tolerance", self.gradient_tolerance),
            ("initial_step_size", self.initial_step_size),
            ("singularity_tolerance", self.singularity_tolerance),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ChoiceError::invalid_option(
                    option,
                    format!("must be finite and positive, found {value}"),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iterations: self.max_iterations,
            gradient_tolerance: self.gradient_tolerance,
            initial_step_size: self.initial_step_size,
            cancellation: self.cancellation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_tolerance() {
        let options = EstimationOptions::default().with_gradient_tolerance(0.0);
        assert!(matches!(
            options.validate(),
            Err(ChoiceError::InvalidOption {
                option: "gradient_tolerance",
                ..
            })
        ));
        assert!(EstimationOptions::default().validate().is_ok());
    }

    #[test]
    fn round_trips_through_json_without_token() {
        let options = EstimationOptions::default()
            .with_method(OptimizerMethod::NewtonRaphson)
            .with_cancellation(CancellationToken::new());
        let json = serde_json::to_string(&options).unwrap();
        let back: EstimationOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, OptimizerMethod::NewtonRaphson);
        assert!(back.cancellation.is_none());
    }
}
