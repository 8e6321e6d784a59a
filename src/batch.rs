//! Runs the full pipeline once per observation group.
//!
//! Groups share nothing mutable: each one fetches its own table, builds its own
//! observations and owns its own result, so a failing group never affects the others.

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{AdapterOptions, ChoiceData, DatasetAdapter};
use crate::error::Result;
use crate::estimation::{EstimationResult, Estimator};
use crate::model::ModelSpecification;
use crate::options::EstimationOptions;
use crate::report::{
    compute_fit_diagnostics, format_for_cost_file, CostFileEntry, CostFileLayout,
    DiagnosticsOptions, FitDiagnostics,
};
use crate::table::TableSource;

/// Settings applied to every group of a batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    pub adapter: AdapterOptions,
    pub estimation: EstimationOptions,
    /// Compute fitted-versus-observed correlations in addition to the coefficients.
    pub diagnostics: Option<DiagnosticsOptions>,
    /// Estimate groups on the rayon thread pool.
    pub parallel: bool,
}

impl BatchOptions {
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsOptions) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_estimation(mut self, estimation: EstimationOptions) -> Self {
        self.estimation = estimation;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterOptions) -> Self {
        self.adapter = adapter;
        self
    }
}

/// Everything produced for one group.
#[derive(Clone, Debug)]
pub struct GroupOutcome {
    pub group: String,
    pub data: ChoiceData,
    pub result: EstimationResult,
    pub coefficients: Vec<CostFileEntry>,
    pub diagnostics: Option<FitDiagnostics>,
}

/// Fetches, adapts, estimates and reports a single group.
pub fn run_group<S>(
    source: &S,
    group: &str,
    spec: &ModelSpecification,
    options: &BatchOptions,
) -> Result<GroupOutcome>
where
    S: TableSource + ?Sized,
{
    let table = source.fetch(group)?;
    let data = DatasetAdapter::adapt(&table, options.adapter.clone())?;
    info!("group {group}: {} observations", data.len());

    let result = Estimator::new(options.estimation.clone()).estimate(spec, &data)?;
    let layout = CostFileLayout::new(group, options.adapter.alternatives.clone());
    let coefficients = format_for_cost_file(&result, &layout);
    let diagnostics = match &options.diagnostics {
        Some(diagnostics) => Some(compute_fit_diagnostics(spec, &data, &result, diagnostics)?),
        None => None,
    };

    Ok(GroupOutcome {
        group: group.to_string(),
        data,
        result,
        coefficients,
        diagnostics,
    })
}

/// Runs every group independently and returns one outcome per group, in input order.
pub fn run_groups<S>(
    source: &S,
    groups: &[String],
    spec: &ModelSpecification,
    options: &BatchOptions,
) -> Vec<(String, Result<GroupOutcome>)>
where
    S: TableSource + Sync + ?Sized,
{
    let run = |group: &String| {
        let outcome = run_group(source, group, spec, options);
        if let Err(err) = &outcome {
            warn!("group {group} failed: {err}");
        }
        (group.clone(), outcome)
    };
    if options.parallel {
        groups.par_iter().map(run).collect()
    } else {
        groups.iter().map(run).collect()
    }
}
