//! Synthetic mode-choice tables drawn from a known logit model.
//!
//! Utilities are `intercept_a + cost_coefficient * ln(cost_a)` plus i.i.d. standard Gumbel
//! noise, so the simulated choices follow exactly the conditional logit the estimator fits.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gumbel};
use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};
use crate::table::{AlternativeId, Table, Value};

/// Parameters of a synthetic data set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub observations: usize,
    pub alternatives: Vec<AlternativeId>,
    /// One intercept per alternative, in the same order.
    pub intercepts: Vec<f64>,
    /// Coefficient of the log-cost.
    pub cost_coefficient: f64,
    /// Raw costs are drawn uniformly from this range.
    pub cost_range: (f64, f64),
    /// Probability that a non-anchor alternative is available.
    pub availability: f64,
    pub quantity_range: (f64, f64),
    /// Written to a `grp` column when set.
    pub group: Option<i64>,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            observations: 500,
            alternatives: vec![1, 2, 3],
            intercepts: vec![0.0, 0.5, -0.5],
            cost_coefficient: -1.5,
            cost_range: (5.0, 50.0),
            availability: 0.9,
            quantity_range: (1.0, 100.0),
            group: None,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> Result<()> {
        if self.alternatives.is_empty() {
            return Err(ChoiceError::invalid_option(
                "alternatives",
                "at least one alternative is required",
            ));
        }
        if self.intercepts.len() != self.alternatives.len() {
            return Err(ChoiceError::dimension_mismatch(
                "simulation intercepts",
                self.alternatives.len(),
                self.intercepts.len(),
            ));
        }
        let (lo, hi) = self.cost_range;
        if !(lo > 0.0 && hi > lo) {
            return Err(ChoiceError::invalid_option(
                "cost_range",
                format!("must satisfy 0 < low < high, found ({lo}, {hi})"),
            ));
        }
        let (lo, hi) = self.quantity_range;
        if !(lo > 0.0 && hi > lo) {
            return Err(ChoiceError::invalid_option(
                "quantity_range",
                format!("must satisfy 0 < low < high, found ({lo}, {hi})"),
            ));
        }
        if !(self.availability > 0.0 && self.availability <= 1.0) {
            return Err(ChoiceError::invalid_option(
                "availability",
                format!("must lie in (0, 1], found {}", self.availability),
            ));
        }
        Ok(())
    }
}

/// Draws a raw table with `choice`, `qty`, `cost<a>`, `avail<a>` and `qty<a>` columns.
///
/// `qty<a>` holds the row quantity split by the true choice probabilities, standing in for
/// observed per-mode flows.
pub fn simulate_table(config: &SimulationConfig) -> Result<Table> {
    config.validate()?;
    let gumbel = Gumbel::new(0.0, 1.0)
        .map_err(|_| ChoiceError::invalid_option("gumbel distribution", "invalid scale"))?;
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let k = config.alternatives.len();
    let n = config.observations;

    let mut choice = Vec::with_capacity(n);
    let mut quantity = Vec::with_capacity(n);
    let mut costs = vec![Vec::with_capacity(n); k];
    let mut availability = vec![Vec::with_capacity(n); k];
    let mut shares = vec![Vec::with_capacity(n); k];

    for _ in 0..n {
        let anchor = rng.gen_range(0..k);
        let mut best: Option<(usize, f64)> = None;
        let mut systematic = Vec::with_capacity(k);
        for slot in 0..k {
            let cost = rng.gen_range(config.cost_range.0..config.cost_range.1);
            let available = slot == anchor || rng.gen_bool(config.availability);
            let v = config.intercepts[slot] + config.cost_coefficient * cost.ln();
            costs[slot].push(Value::Number(cost));
            availability[slot].push(Value::Number(if available { 1.0 } else { 0.0 }));
            if available {
                systematic.push((slot, v));
                let total = v + gumbel.sample(&mut rng);
                if best.map_or(true, |(_, b)| total > b) {
                    best = Some((slot, total));
                }
            }
        }

        let q = rng.gen_range(config.quantity_range.0..config.quantity_range.1);
        let max = systematic
            .iter()
            .map(|(_, v)| *v)
            .fold(f64::NEG_INFINITY, f64::max);
        let denominator: f64 = systematic.iter().map(|(_, v)| (v - max).exp()).sum();
        for (slot, column) in shares.iter_mut().enumerate() {
            let share = systematic
                .iter()
                .find(|(s, _)| *s == slot)
                .map_or(0.0, |(_, v)| (v - max).exp() / denominator);
            column.push(Value::Number(q * share));
        }

        // The anchor is always available, so `best` is set.
        let chosen = best.map_or(anchor, |(slot, _)| slot);
        choice.push(Value::Number(f64::from(config.alternatives[chosen])));
        quantity.push(Value::Number(q));
    }

    let mut table = Table::new();
    if let Some(group) = config.group {
        table.push_column("grp", vec![Value::Number(group as f64); n])?;
    }
    table.push_column("choice", choice)?;
    table.push_column("qty", quantity)?;
    for (slot, alternative) in config.alternatives.iter().enumerate() {
        table.push_column(format!("cost{alternative}"), std::mem::take(&mut costs[slot]))?;
        table.push_column(
            format!("avail{alternative}"),
            std::mem::take(&mut availability[slot]),
        )?;
        table.push_column(format!("qty{alternative}"), std::mem::take(&mut shares[slot]))?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_table_is_consistent() {
        let config = SimulationConfig {
            observations: 200,
            availability: 0.5,
            ..SimulationConfig::default()
        };
        let table = simulate_table(&config).unwrap();
        assert_eq!(table.row_count(), 200);

        let choice = table.column("choice").unwrap();
        for row in 0..table.row_count() {
            let chosen = choice[row].as_f64().unwrap() as u32;
            let avail = table.column(&format!("avail{chosen}")).unwrap()[row].as_f64();
            assert_eq!(avail, Some(1.0));
        }
    }

    #[test]
    fn same_seed_reproduces_table() {
        let config = SimulationConfig::default();
        assert_eq!(simulate_table(&config).unwrap(), simulate_table(&config).unwrap());
    }

    #[test]
    fn rejects_mismatched_intercepts() {
        let config = SimulationConfig {
            intercepts: vec![0.0],
            ..SimulationConfig::default()
        };
        assert!(matches!(
            simulate_table(&config),
            Err(ChoiceError::DimensionMismatch { .. })
        ));
    }
}
