//! Observation containers and the adapter that turns a raw group table into them.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};
use crate::table::{AlternativeId, Table, Value};

/// Policy used to fill missing numeric cells.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ImputationStrategy {
    /// Replace missing cells by the column maximum.
    ColumnMaximum,
    /// Replace missing cells by the column maximum times a multiplier (e.g. `1000.0`).
    ScaledColumnMaximum(f64),
    /// Reject tables with missing numeric cells.
    Fail,
}

/// Number of observations the weights are renormalized to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SampleSize {
    /// Use the number of rows of the group table.
    RowCount,
    /// Use a caller-supplied sample size.
    Declared(f64),
    /// Read the sample size from the first row of a column.
    Column(String),
}

/// Monotone transform applied to cost columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostTransform {
    NaturalLog,
    Identity,
}

impl CostTransform {
    fn apply(self, value: f64) -> f64 {
        match self {
            CostTransform::NaturalLog => value.ln(),
            CostTransform::Identity => value,
        }
    }
}

/// Column naming and data preparation settings for [`DatasetAdapter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Alternatives of the choice set; columns are looked up as `<prefix><id>`.
    pub alternatives: Vec<AlternativeId>,
    pub choice_column: String,
    pub quantity_column: String,
    pub cost_prefix: String,
    pub availability_prefix: String,
    pub imputation: ImputationStrategy,
    pub cost_transform: CostTransform,
    pub sample_size: SampleSize,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            alternatives: vec![1, 2, 3],
            choice_column: "choice".to_string(),
            quantity_column: "qty".to_string(),
            cost_prefix: "cost".to_string(),
            availability_prefix: "avail".to_string(),
            imputation: ImputationStrategy::ColumnMaximum,
            cost_transform: CostTransform::NaturalLog,
            sample_size: SampleSize::RowCount,
        }
    }
}

impl AdapterOptions {
    /// Overrides the declared alternatives.
    pub fn with_alternatives(mut self, alternatives: Vec<AlternativeId>) -> Self {
        self.alternatives = alternatives;
        self
    }

    /// Overrides the missing-value policy.
    pub fn with_imputation(mut self, imputation: ImputationStrategy) -> Self {
        self.imputation = imputation;
        self
    }

    /// Overrides the transform applied to cost columns.
    pub fn with_cost_transform(mut self, transform: CostTransform) -> Self {
        self.cost_transform = transform;
        self
    }

    /// Overrides how the renormalization sample size is obtained.
    pub fn with_sample_size(mut self, sample_size: SampleSize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Cost column of an alternative, e.g. `cost2`.
    pub fn cost_column(&self, alternative: AlternativeId) -> String {
        format!("{}{}", self.cost_prefix, alternative)
    }

    /// Availability column of an alternative, e.g. `avail2`.
    pub fn availability_column(&self, alternative: AlternativeId) -> String {
        format!("{}{}", self.availability_prefix, alternative)
    }

    fn required_columns(&self) -> Vec<String> {
        let mut columns = vec![
            self.choice_column.to_lowercase(),
            self.quantity_column.to_lowercase(),
        ];
        for alternative in &self.alternatives {
            columns.push(self.cost_column(*alternative).to_lowercase());
            columns.push(self.availability_column(*alternative).to_lowercase());
        }
        columns
    }
}

/// One adapted row of a group table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Row index in the group table.
    pub row: usize,
    /// Transformed cost per alternative.
    pub costs: BTreeMap<AlternativeId, f64>,
    pub availability: BTreeMap<AlternativeId, bool>,
    pub chosen: AlternativeId,
    /// Raw quantity carried by this choice instance.
    pub quantity: f64,
    /// Renormalized sample weight, averaging one over the group.
    pub weight: f64,
    /// Every numeric column of the row after imputation and transforms, keyed by lowercase name.
    pub covariates: HashMap<String, f64>,
}

impl Observation {
    /// Transformed cost of `alternative`, if declared.
    pub fn cost(&self, alternative: AlternativeId) -> Option<f64> {
        self.costs.get(&alternative).copied()
    }

    /// Whether `alternative` could have been chosen.
    pub fn is_available(&self, alternative: AlternativeId) -> bool {
        self.availability.get(&alternative).copied().unwrap_or(false)
    }

    /// Numeric column value by (case-insensitive) name.
    pub fn covariate(&self, column: &str) -> Option<f64> {
        self.covariates
            .get(column)
            .or_else(|| self.covariates.get(&column.to_lowercase()))
            .copied()
    }
}

/// Immutable set of observations for one group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChoiceData {
    alternatives: Vec<AlternativeId>,
    observations: Vec<Observation>,
}

impl ChoiceData {
    /// Builds a data set from already adapted observations, re-checking the availability invariant.
    pub fn new(alternatives: Vec<AlternativeId>, observations: Vec<Observation>) -> Result<Self> {
        for observation in &observations {
            if !alternatives.contains(&observation.chosen) {
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
        Ok(Self {
            alternatives,
            observations,
        })
    }

    /// Declared alternatives in column order.
    pub fn alternatives(&self) -> &[AlternativeId] {
        &self.alternatives
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Sum of renormalized weights.
    pub fn total_weight(&self) -> f64 {
        self.observations.iter().map(|o| o.weight).sum()
    }
}

/// Normalizes a raw group table into [`ChoiceData`].
///
/// The adapter works on its own copy of the table; the source table is never mutated.
/// Steps can be run individually, or all at once with [`DatasetAdapter::adapt`].
#[derive(Clone, Debug)]
pub struct DatasetAdapter {
    table: Table,
    options: AdapterOptions,
    weights: Option<Vec<f64>>,
}

impl DatasetAdapter {
    /// Starts adapting a copy of `table`.
    pub fn new(table: &Table, options: AdapterOptions) -> Self {
        Self {
            table: table.clone(),
            options,
            weights: None,
        }
    }

    /// Runs column normalization, imputation, cost transform and weight renormalization in order.
    pub fn adapt(table: &Table, options: AdapterOptions) -> Result<ChoiceData> {
        let mut adapter = Self::new(table, options);
        adapter.normalize_columns()?;
        adapter.impute_missing(adapter.options.imputation)?;
        let cost_columns: Vec<String> = adapter
            .options
            .alternatives
            .iter()
            .map(|a| adapter.options.cost_column(*a).to_lowercase())
            .collect();
        adapter.transform_costs(&cost_columns, adapter.options.cost_transform)?;
        let sample_size = adapter.options.sample_size.clone();
        adapter.renormalize_weights(&sample_size)?;
        adapter.build()
    }

    /// The working copy of the table.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Lowercases every column name and checks that required columns are present.
    pub fn normalize_columns(&mut self) -> Result<&mut Self> {
        self.table.rename_columns(|name| name.to_lowercase());
        let mut seen = HashSet::new();
        if let Some(name) = self.table.column_names().find(|name| !seen.insert(*name)) {
            return Err(ChoiceError::DuplicateName {
                name: name.to_string(),
            });
        }
        for column in self.options.required_columns() {
            if self.table.column(&column).is_none() {
                return Err(ChoiceError::schema(column));
            }
        }
        Ok(self)
    }

    /// Fills missing cells of every numeric column according to `strategy`.
    ///
    /// Columns holding text are left untouched. Returns the number of cells imputed.
    pub fn impute_missing(&mut self, strategy: ImputationStrategy) -> Result<usize> {
        if let ImputationStrategy::ScaledColumnMaximum(multiplier) = strategy {
            if !multiplier.is_finite() || multiplier <= 0.0 {
                return Err(ChoiceError::invalid_option(
                    "imputation multiplier",
                    format!("must be finite and positive, found {multiplier}"),
                ));
            }
        }

        let mut imputed = 0usize;
        for (name, values) in self.table.columns_mut() {
            if values.iter().any(|v| matches!(v, Value::Text(_))) {
                continue;
            }
            let missing = values.iter().filter(|v| v.is_missing()).count();
            if missing == 0 {
                continue;
            }
            let maximum = values
                .iter()
                .filter_map(Value::as_f64)
                .fold(f64::NEG_INFINITY, f64::max);
            let fill = match strategy {
                ImputationStrategy::Fail => {
                    let row = values.iter().position(Value::is_missing).unwrap_or(0);
                    return Err(ChoiceError::domain(name, row, f64::NAN, "missing value"));
                }
                // Nothing to take a maximum over; leave the column for later validation.
                _ if maximum == f64::NEG_INFINITY => continue,
                ImputationStrategy::ColumnMaximum => maximum,
                ImputationStrategy::ScaledColumnMaximum(multiplier) => maximum * multiplier,
            };
            for value in values.iter_mut().filter(|v| v.is_missing()) {
                *value = Value::Number(fill);
            }
            debug!("imputed {missing} missing values in `{name}` with {fill}");
            imputed += missing;
        }
        if imputed > 0 {
            info!("imputed {imputed} missing values");
        }
        Ok(imputed)
    }

    /// Applies `transform` to each listed column, rejecting non-positive values for the log.
    pub fn transform_costs(&mut self, columns: &[String], transform: CostTransform) -> Result<()> {
        for column in columns {
            let values = self
                .table
                .column_mut(column)
                .ok_or_else(|| ChoiceError::schema(column.clone()))?;
            // Validate the whole column first so a failure leaves it untouched.
            let mut transformed = Vec::with_capacity(values.len());
            for (row, value) in values.iter().enumerate() {
                let raw = value.as_f64().ok_or_else(|| {
                    ChoiceError::domain(column.clone(), row, f64::NAN, "cost is not numeric")
                })?;
                if transform == CostTransform::NaturalLog && raw <= 0.0 {
                    return Err(ChoiceError::domain(
                        column.clone(),
                        row,
                        raw,
                        "cost must be positive before taking its log",
                    ));
                }
                transformed.push(Value::Number(transform.apply(raw)));
            }
            *values = transformed;
        }
        Ok(())
    }

    /// Computes `weight_i = quantity_i * n / sum(quantity)`.
    pub fn renormalize_weights(&mut self, sample_size: &SampleSize) -> Result<&[f64]> {
        let column = self.options.quantity_column.to_lowercase();
        let values = self
            .table
            .column(&column)
            .ok_or_else(|| ChoiceError::schema(column.clone()))?;

        let mut quantities = Vec::with_capacity(values.len());
        for (row, value) in values.iter().enumerate() {
            let quantity = value.as_f64().ok_or_else(|| {
                ChoiceError::domain(column.clone(), row, f64::NAN, "quantity is not numeric")
            })?;
            if !quantity.is_finite() || quantity < 0.0 {
                return Err(ChoiceError::domain(
                    column.clone(),
                    row,
                    quantity,
                    "quantity must be finite and non-negative",
                ));
            }
            quantities.push(quantity);
        }

        let total: f64 = quantities.iter().sum();
        if total <= 0.0 {
            return Err(ChoiceError::ZeroTotalQuantity { column, total });
        }

        let n = match sample_size {
            SampleSize::RowCount => quantities.len() as f64,
            SampleSize::Declared(n) => *n,
            SampleSize::Column(name) => {
                let name = name.to_lowercase();
                self.table
                    .column(&name)
                    .ok_or_else(|| ChoiceError::schema(name.clone()))?
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ChoiceError::domain(name, 0, f64::NAN, "sample size missing"))?
            }
        };
        if !n.is_finite() || n <= 0.0 {
            return Err(ChoiceError::invalid_option(
                "sample size",
                format!("must be finite and positive, found {n}"),
            ));
        }

        let weights = quantities.iter().map(|q| q * n / total).collect();
        Ok(self.weights.insert(weights).as_slice())
    }

    /// Produces the immutable observation set, renormalizing weights first if not yet done.
    pub fn build(mut self) -> Result<ChoiceData> {
        let weights = match self.weights.take() {
            Some(weights) => weights,
            None => {
                let sample_size = self.options.sample_size.clone();
                self.renormalize_weights(&sample_size)?.to_vec()
            }
        };

        let options = &self.options;
        let table = &self.table;
        let choice = required_column(table, &options.choice_column)?;
        let quantity = required_column(table, &options.quantity_column)?;
        let mut per_alternative = Vec::with_capacity(options.alternatives.len());
        for alternative in &options.alternatives {
            let cost_name = options.cost_column(*alternative).to_lowercase();
            let avail_name = options.availability_column(*alternative).to_lowercase();
            let cost = required_column(table, &cost_name)?;
            let avail = required_column(table, &avail_name)?;
            per_alternative.push((*alternative, cost_name, cost, avail_name, avail));
        }

        let mut observations = Vec::with_capacity(table.row_count());
        for row in 0..table.row_count() {
            let chosen_raw = numeric_cell(&options.choice_column, choice, row)?;
            if chosen_raw < 0.0 || chosen_raw.fract() != 0.0 {
                return Err(ChoiceError::domain(
                    options.choice_column.clone(),
                    row,
                    chosen_raw,
                    "choice must be a non-negative integer",
                ));
            }
            let chosen = chosen_raw as AlternativeId;

            let mut costs = BTreeMap::new();
            let mut availability = BTreeMap::new();
            for (alternative, cost_name, cost, avail_name, avail) in &per_alternative {
                costs.insert(*alternative, numeric_cell(cost_name, cost, row)?);
                availability.insert(*alternative, numeric_cell(avail_name, avail, row)? != 0.0);
            }

            let covariates = table
                .columns()
                .filter_map(|(name, values)| values[row].as_f64().map(|v| (name.to_string(), v)))
                .collect();

            observations.push(Observation {
                row,
                costs,
                availability,
                chosen,
                quantity: numeric_cell(&options.quantity_column, quantity, row)?,
                weight: weights[row],
                covariates,
            });
        }

        ChoiceData::new(options.alternatives.clone(), observations)
    }
}

fn required_column<'a>(table: &'a Table, name: &str) -> Result<&'a [Value]> {
    let name = name.to_lowercase();
    table.column(&name).ok_or_else(|| ChoiceError::schema(name))
}

fn numeric_cell(column: &str, values: &[Value], row: usize) -> Result<f64> {
    values[row]
        .as_f64()
        .ok_or_else(|| ChoiceError::domain(column, row, f64::NAN, "value is not numeric"))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn raw_table() -> Table {
        Table::new()
            .with_column("CHOICE", [1.0, 2.0, 3.0, 1.0])
            .unwrap()
            .with_column("Qty", [10.0, 30.0, 20.0, 40.0])
            .unwrap()
            .with_column("COST1", [Some(10.0), Some(12.0), None, Some(8.0)])
            .unwrap()
            .with_column("cost2", [20.0, 18.0, 25.0, 22.0])
            .unwrap()
            .with_column("Cost3", [30.0, 35.0, 28.0, 40.0])
            .unwrap()
            .with_column("avail1", [1.0, 1.0, 1.0, 1.0])
            .unwrap()
            .with_column("avail2", [1.0, 1.0, 0.0, 1.0])
            .unwrap()
            .with_column("avail3", [1.0, 0.0, 1.0, 1.0])
            .unwrap()
            .with_column("od", ["a-b", "a-c", "b-c", "c-a"])
            .unwrap()
    }

    #[test]
    fn normalization_is_idempotent() {
        let table = raw_table();
        let mut adapter = DatasetAdapter::new(&table, AdapterOptions::default());
        adapter.normalize_columns().unwrap();
        let once: Vec<String> = adapter.table().column_names().map(String::from).collect();
        adapter.normalize_columns().unwrap();
        let twice: Vec<String> = adapter.table().column_names().map(String::from).collect();
        assert_eq!(once, twice);
        assert!(once.contains(&"cost1".to_string()));
        // The source table keeps its original casing.
        assert!(table.column("CHOICE").is_some());
    }

    #[test]
    fn missing_required_column_is_a_schema_error() {
        let table = Table::new().with_column("choice", [1.0]).unwrap();
        let mut adapter = DatasetAdapter::new(&table, AdapterOptions::default());
        let err = adapter.normalize_columns().unwrap_err();
        assert!(matches!(err, ChoiceError::Schema { ref column } if column == "qty"));
    }

    #[test]
    fn columns_differing_only_in_case_collide() {
        let table = raw_table().with_column("QTY", [1.0, 1.0, 1.0, 1.0]).unwrap();
        let mut adapter = DatasetAdapter::new(&table, AdapterOptions::default());
        assert!(matches!(
            adapter.normalize_columns(),
            Err(ChoiceError::DuplicateName { ref name }) if name == "qty"
        ));
    }

    #[test]
    fn imputation_uses_configured_multiplier() {
        let table = raw_table();
        let mut adapter = DatasetAdapter::new(&table, AdapterOptions::default());
        adapter.normalize_columns().unwrap();
        let count = adapter
            .impute_missing(ImputationStrategy::ScaledColumnMaximum(1000.0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            adapter.table().column("cost1").unwrap()[2],
            Value::Number(12_000.0)
        );
        assert_eq!(
            adapter.table().column("od").unwrap()[0],
            Value::Text("a-b".to_string())
        );
    }

    #[test]
    fn non_positive_cost_is_a_domain_error() {
        let table = raw_table()
            .with_column("cost2", [20.0, 0.0, 25.0, 22.0])
            .unwrap();
        let result = DatasetAdapter::adapt(&table, AdapterOptions::default());
        assert!(matches!(
            result,
            Err(ChoiceError::Domain { ref column, row: 1, .. }) if column == "cost2"
        ));
    }

    #[test]
    fn weights_average_to_one() {
        let data = DatasetAdapter::adapt(&raw_table(), AdapterOptions::default()).unwrap();
        assert_eq!(data.len(), 4);
        assert_relative_eq!(data.total_weight() / data.len() as f64, 1.0, epsilon = 1e-12);
        assert_relative_eq!(data.observations()[0].weight, 0.4, epsilon = 1e-12);
        assert_relative_eq!(data.observations()[0].cost(2).unwrap(), 20.0_f64.ln());
        assert_eq!(data.observations()[0].quantity, 10.0);
    }

    #[test]
    fn declared_sample_size_scales_weights() {
        let options = AdapterOptions::default().with_sample_size(SampleSize::Declared(8.0));
        let data = DatasetAdapter::adapt(&raw_table(), options).unwrap();
        assert_relative_eq!(data.total_weight(), 8.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_total_quantity_is_rejected() {
        let table = raw_table()
            .with_column("Qty", [0.0, 0.0, 0.0, 0.0])
            .unwrap();
        let result = DatasetAdapter::adapt(&table, AdapterOptions::default());
        assert!(matches!(result, Err(ChoiceError::ZeroTotalQuantity { .. })));
    }

    #[test]
    fn unavailable_choice_fails_before_estimation() {
        let table = raw_table()
            .with_column("avail1", [0.0, 1.0, 1.0, 1.0])
            .unwrap();
        let result = DatasetAdapter::adapt(&table, AdapterOptions::default());
        assert!(matches!(
            result,
            Err(ChoiceError::ChosenUnavailable { row: 0, alternative: 1 })
        ));
    }
}
