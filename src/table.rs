//! Heterogeneous column tables and the narrow interface used to fetch them.
//!
//! The estimation core never talks to a database or a running application. Whatever
//! produces the observations only has to hand over a [`Table`] through a [`TableSource`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};

/// Identifier of one alternative inside a choice set (e.g. a transport mode number).
pub type AlternativeId = u32;

/// One cell of a [`Table`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
    Missing,
}

impl Value {
    /// Numeric view of the cell; `None` for text and missing cells.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) if !v.is_nan() => Some(*v),
            _ => None,
        }
    }

    /// Whether the cell carries no usable number.
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Number(v) => v.is_nan(),
            Value::Missing => true,
            Value::Text(_) => false,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Value::Missing, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// Column-oriented table: ordered column names mapped to equally long value sequences.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<(String, Vec<Value>)>,
}

impl Table {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column, rejecting lengths that differ from the existing columns.
    pub fn with_column<V: Into<Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self> {
        self.push_column(name, values.into_iter().map(Into::into).collect())?;
        Ok(self)
    }

    /// Appends or replaces a column in place.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> Result<()> {
        let name = name.into();
        if let Some(rows) = self.columns.first().map(|(_, v)| v.len()) {
            if values.len() != rows {
                return Err(ChoiceError::dimension_mismatch(
                    "column length",
                    rows,
                    values.len(),
                ));
            }
        }
        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = values,
            None => self.columns.push((name, values)),
        }
        Ok(())
    }

    /// Number of rows (zero for a table without columns).
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |(_, v)| v.len())
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Exact-name column lookup.
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values.as_slice())
    }

    pub(crate) fn column_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.columns
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values)
    }

    pub(crate) fn columns(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub(crate) fn columns_mut(&mut self) -> impl Iterator<Item = (&str, &mut Vec<Value>)> {
        self.columns
            .iter_mut()
            .map(|(name, values)| (name.as_str(), values))
    }

    pub(crate) fn rename_columns(&mut self, mut rename: impl FnMut(&str) -> String) {
        for (name, _) in self.columns.iter_mut() {
            *name = rename(name);
        }
    }

    /// Keeps only the rows for which `keep` returns `true`.
    pub fn filter_rows(&self, mut keep: impl FnMut(usize) -> bool) -> Table {
        let selected: Vec<usize> = (0..self.row_count()).filter(|row| keep(*row)).collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    selected.iter().map(|row| values[*row].clone()).collect(),
                )
            })
            .collect();
        Table { columns }
    }
}

/// Narrow interface for whatever retrieves observation tables (database, running application, files).
pub trait TableSource {
    /// Returns the table matching `selector`, e.g. one observation group.
    fn fetch(&self, selector: &str) -> Result<Table>;
}

/// In-memory [`TableSource`] keyed by selector.
#[derive(Clone, Debug, Default)]
pub struct MemoryTableSource {
    tables: HashMap<String, Table>,
}

impl MemoryTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `table` under `selector`, replacing any previous entry.
    pub fn insert(&mut self, selector: impl Into<String>, table: Table) {
        self.tables.insert(selector.into(), table);
    }

    /// Splits `table` by the numeric value of `group_column`, one entry per distinct group.
    pub fn partitioned(table: &Table, group_column: &str) -> Result<Self> {
        let groups = table
            .column(group_column)
            .ok_or_else(|| ChoiceError::schema(group_column))?;
        let mut keys: Vec<i64> = Vec::new();
        for (row, value) in groups.iter().enumerate() {
            let number = value.as_f64().ok_or_else(|| {
                ChoiceError::domain(group_column, row, f64::NAN, "group identifier must be numeric")
            })?;
            if number.fract() != 0.0 || number.abs() > i64::MAX as f64 {
                return Err(ChoiceError::domain(
                    group_column,
                    row,
                    number,
                    "group identifier must be an integer",
                ));
            }
            let key = number as i64;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let mut source = Self::new();
        for key in keys {
            let part = table.filter_rows(|row| groups[row].as_f64().map(|v| v as i64) == Some(key));
            source.insert(key.to_string(), part);
        }
        Ok(source)
    }

    /// Registered selectors, sorted.
    pub fn selectors(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tables.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl TableSource for MemoryTableSource {
    fn fetch(&self, selector: &str) -> Result<Table> {
        self.tables
            .get(selector)
            .cloned()
            .ok_or_else(|| ChoiceError::Source {
                selector: selector.to_string(),
                reason: "no table registered".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_columns() {
        let table = Table::new()
            .with_column("a", [1.0, 2.0])
            .unwrap()
            .with_column("b", [1.0]);
        assert!(matches!(
            table,
            Err(ChoiceError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn partitions_by_group_column() {
        let table = Table::new()
            .with_column("grp", [0.0, 1.0, 0.0])
            .unwrap()
            .with_column("qty", [5.0, 6.0, 7.0])
            .unwrap();
        let source = MemoryTableSource::partitioned(&table, "grp").unwrap();
        assert_eq!(source.selectors(), vec!["0".to_string(), "1".to_string()]);

        let first = source.fetch("0").unwrap();
        assert_eq!(first.row_count(), 2);
        assert_eq!(first.column("qty").unwrap()[1], Value::Number(7.0));
        assert!(matches!(source.fetch("9"), Err(ChoiceError::Source { .. })));
    }

    #[test]
    fn fractional_group_identifiers_are_rejected() {
        let table = Table::new()
            .with_column("grp", [1.0, 1.5, 2.0])
            .unwrap()
            .with_column("qty", [5.0, 6.0, 7.0])
            .unwrap();
        assert!(matches!(
            MemoryTableSource::partitioned(&table, "grp"),
            Err(ChoiceError::Domain { ref column, row: 1, value, .. }) if column == "grp" && value == 1.5
        ));

        let table = Table::new().with_column("grp", [-3.0, 4.0]).unwrap();
        let source = MemoryTableSource::partitioned(&table, "grp").unwrap();
        assert_eq!(source.selectors(), vec!["-3".to_string(), "4".to_string()]);
    }
}
