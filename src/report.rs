//! Cost-file coefficients and fitted-versus-observed diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::ChoiceData;
use crate::error::{ChoiceError, Result};
use crate::estimation::EstimationResult;
use crate::likelihood::choice_probabilities;
use crate::model::ModelSpecification;
use crate::table::AlternativeId;

/// How estimated parameters are keyed in a cost file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostFileLayout {
    /// Group suffix appended to every key.
    pub group: String,
    /// Alternatives a shared coefficient is repeated for.
    pub alternatives: Vec<AlternativeId>,
    /// Parameters whose name contains this marker are alternative-specific constants.
    pub intercept_marker: String,
}

impl CostFileLayout {
    pub fn new(group: impl Into<String>, alternatives: Vec<AlternativeId>) -> Self {
        Self {
            group: group.into(),
            alternatives,
            intercept_marker: "intercept".to_string(),
        }
    }

    pub fn with_intercept_marker(mut self, marker: impl Into<String>) -> Self {
        self.intercept_marker = marker.into();
        self
    }
}

/// One `key = value` line of a cost file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostFileEntry {
    pub key: String,
    pub value: f64,
}

impl fmt::Display for CostFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.value)
    }
}

/// Lays out the estimated parameters for a cost file.
///
/// Intercepts already name their alternative and are emitted once, as `name.group`.
/// Every other coefficient is shared by all modes and is repeated as `name.mode.group`.
/// Fixed parameters are not estimates and are left out.
pub fn format_for_cost_file(result: &EstimationResult, layout: &CostFileLayout) -> Vec<CostFileEntry> {
    let mut entries = Vec::new();
    for (name, value) in result.beta_values() {
        if name.contains(&layout.intercept_marker) {
            entries.push(CostFileEntry {
                key: format!("{name}.{}", layout.group),
                value,
            });
        } else {
            for alternative in &layout.alternatives {
                entries.push(CostFileEntry {
                    key: format!("{name}.{alternative}.{}", layout.group),
                    value,
                });
            }
        }
    }
    entries
}

/// Settings for [`compute_fit_diagnostics`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsOptions {
    /// Observed quantity of alternative `a` is read from column `<prefix><a>`.
    pub observed_quantity_prefix: String,
    /// Keep only rows that chose this alternative, so each origin-destination pair counts once.
    pub reference_choice: Option<AlternativeId>,
}

impl Default for DiagnosticsOptions {
    fn default() -> Self {
        Self {
            observed_quantity_prefix: "qty".to_string(),
            reference_choice: Some(1),
        }
    }
}

/// Fit of one alternative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlternativeFit {
    pub alternative: AlternativeId,
    /// Pearson correlation between predicted and observed quantities; `None` if either has zero variance.
    pub correlation: Option<f64>,
    pub observations: usize,
}

/// Per-alternative correlations between fitted and observed quantities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub alternatives: Vec<AlternativeFit>,
}

impl FitDiagnostics {
    pub fn correlation(&self, alternative: AlternativeId) -> Option<f64> {
        self.alternatives
            .iter()
            .find(|fit| fit.alternative == alternative)
            .and_then(|fit| fit.correlation)
    }
}

/// Pearson correlation; `None` for fewer than two points or a constant sequence.
pub fn pearson_correlation(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    let r = sxy / (sxx.sqrt() * syy.sqrt());
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Compares model-implied quantities with observed ones, alternative by alternative.
///
/// Predicted quantity is the raw (not renormalized) quantity of the row times the fitted
/// probability of the alternative, using the estimated parameters. Estimation is not affected.
pub fn compute_fit_diagnostics(
    spec: &ModelSpecification,
    data: &ChoiceData,
    result: &EstimationResult,
    options: &DiagnosticsOptions,
) -> Result<FitDiagnostics> {
    let model = spec.compile()?;
    let values = result.values();
    let alternatives: Vec<AlternativeId> = spec.alternatives().collect();

    let mut predicted: Vec<Vec<f64>> = vec![Vec::new(); alternatives.len()];
    let mut observed: Vec<Vec<f64>> = vec![Vec::new(); alternatives.len()];

    let rows = data
        .observations()
        .iter()
        .filter(|o| options.reference_choice.map_or(true, |c| o.chosen == c));
    for observation in rows {
        let probabilities = choice_probabilities(&model, observation, &values)?;
        for (slot, alternative) in alternatives.iter().enumerate() {
            let column = format!("{}{}", options.observed_quantity_prefix, alternative).to_lowercase();
            let actual = observation
                .covariate(&column)
                .ok_or(ChoiceError::MissingCovariate {
                    column,
                    row: observation.row,
                })?;
            let probability = probabilities
                .iter()
                .find(|(a, _)| a == alternative)
                .map_or(0.0, |(_, p)| *p);
            predicted[slot].push(observation.quantity * probability);
            observed[slot].push(actual);
        }
    }

    let alternatives = alternatives
        .into_iter()
        .enumerate()
        .map(|(slot, alternative)| AlternativeFit {
            alternative,
            correlation: pearson_correlation(&predicted[slot], &observed[slot]),
            observations: observed[slot].len(),
        })
        .collect();
    Ok(FitDiagnostics { alternatives })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use approx::assert_relative_eq;

    use super::*;
    use crate::data::Observation;
    use crate::estimation::{
        BoundHandling, ConvergenceStatus, InformationStatus, ParameterEstimate,
    };
    use crate::formulation::UtilityExpression;
    use crate::model::Bounds;
    use crate::options::CovarianceKind;

    fn estimate(name: &str, value: f64, fixed: bool) -> ParameterEstimate {
        ParameterEstimate {
            name: name.to_string(),
            estimate: value,
            std_error: None,
            t_statistic: None,
            p_value: None,
            robust_std_error: None,
            fixed,
            at_bound: false,
        }
    }

    fn result() -> EstimationResult {
        EstimationResult {
            parameters: vec![
                estimate("(intercept).1", 0.0, true),
                estimate("(intercept).2", 0.4, false),
                estimate("log(cost)", -1.5, false),
            ],
            log_likelihood: -10.0,
            initial_log_likelihood: -12.0,
            null_log_likelihood: -12.0,
            status: ConvergenceStatus::Converged,
            iterations: 5,
            gradient_norm: 0.0,
            information: InformationStatus::NotComputed,
            covariance_kind: CovarianceKind::Observed,
            covariance: None,
            bound_handling: BoundHandling::Projection,
            sample_size: 10,
        }
    }

    #[test]
    fn shared_coefficients_repeat_per_mode() {
        let lines: Vec<String> = format_for_cost_file(&result(), &CostFileLayout::new("0", vec![1, 2, 3]))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "(intercept).2.0 = 0.4",
                "log(cost).1.0 = -1.5",
                "log(cost).2.0 = -1.5",
                "log(cost).3.0 = -1.5",
            ]
        );
    }

    fn observation(
        row: usize,
        chosen: AlternativeId,
        quantity: f64,
        second_available: bool,
        observed: [f64; 2],
    ) -> Observation {
        Observation {
            row,
            costs: BTreeMap::from([(1, 1.0), (2, 1.0)]),
            availability: BTreeMap::from([(1, true), (2, second_available)]),
            chosen,
            quantity,
            weight: 1.0,
            covariates: HashMap::from([
                ("qty1".to_string(), observed[0]),
                ("qty2".to_string(), observed[1]),
                ("flat1".to_string(), 4.0),
                ("flat2".to_string(), 4.0),
            ]),
        }
    }

    #[test]
    fn diagnostics_correlate_expected_and_observed_quantities() {
        let mut spec = ModelSpecification::new();
        spec.add_parameter("asc1", 0.0, Bounds::unbounded(), true)
            .unwrap()
            .add_parameter("asc2", 0.0, Bounds::unbounded(), false)
            .unwrap();
        spec.set_utility(1, UtilityExpression::new().intercept("asc1"))
            .unwrap()
            .set_utility(2, UtilityExpression::new().intercept("asc2"))
            .unwrap();
        // exp(asc2) = 3 puts probability 1/4 on mode 1 and 3/4 on mode 2 when both are available.
        let mut fitted = result();
        fitted.parameters = vec![
            estimate("asc1", 0.0, true),
            estimate("asc2", 3.0_f64.ln(), false),
        ];
        let data = ChoiceData::new(
            vec![1, 2],
            vec![
                observation(0, 1, 4.0, true, [2.0, 5.0]),
                observation(1, 1, 8.0, true, [3.0, 9.0]),
                observation(2, 1, 12.0, false, [10.0, 7.0]),
                observation(3, 2, 100.0, true, [1.0, 90.0]),
            ],
        )
        .unwrap();

        let diagnostics =
            compute_fit_diagnostics(&spec, &data, &fitted, &DiagnosticsOptions::default()).unwrap();
        // Rows choosing mode 2 are skipped; predicted quantities are (1, 2, 12) and (3, 6, 0).
        assert_eq!(diagnostics.alternatives.len(), 2);
        assert!(diagnostics.alternatives.iter().all(|fit| fit.observations == 3));
        assert_relative_eq!(
            diagnostics.correlation(1).unwrap(),
            53.0 / (74.0_f64 * 38.0).sqrt(),
            epsilon = 1e-9
        );
        assert_relative_eq!(diagnostics.correlation(2).unwrap(), 0.5, epsilon = 1e-9);

        let every_row = DiagnosticsOptions {
            reference_choice: None,
            ..DiagnosticsOptions::default()
        };
        let diagnostics = compute_fit_diagnostics(&spec, &data, &fitted, &every_row).unwrap();
        assert_eq!(diagnostics.alternatives[0].observations, 4);

        let constant = DiagnosticsOptions {
            observed_quantity_prefix: "FLAT".to_string(),
            ..DiagnosticsOptions::default()
        };
        let diagnostics = compute_fit_diagnostics(&spec, &data, &fitted, &constant).unwrap();
        assert_eq!(diagnostics.correlation(1), None);
        assert_eq!(diagnostics.correlation(2), None);

        let missing = DiagnosticsOptions {
            observed_quantity_prefix: "trips".to_string(),
            ..DiagnosticsOptions::default()
        };
        assert!(matches!(
            compute_fit_diagnostics(&spec, &data, &fitted, &missing),
            Err(ChoiceError::MissingCovariate { ref column, row: 0 }) if column == "trips1"
        ));
    }

    #[test]
    fn correlation_is_bounded_or_undefined() {
        let r = pearson_correlation(&[1.0, 2.0, 3.0, 4.0], &[2.0, 4.1, 5.9, 8.2]).unwrap();
        assert!((-1.0..=1.0).contains(&r));
        assert!(r > 0.99);
        assert_relative_eq!(
            pearson_correlation(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap(),
            -1.0
        );
        assert_eq!(pearson_correlation(&[1.0, 2.0, 3.0], &[5.0, 5.0, 5.0]), None);
        assert_eq!(pearson_correlation(&[1.0], &[1.0]), None);
    }
}
