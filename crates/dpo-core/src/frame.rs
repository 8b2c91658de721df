//! The row frame exchanged between the orchestrator and its backends.
//!
//! The orchestrator pins a concrete currency for payloads the same way a
//! compute engine pins its batch type: a [`DataFrame`] is a list of JSON
//! records plus the column names observed in them. Backends produce and
//! consume frames through the capability traits; the core only moves them
//! along subfeeds and applies partition and row filters.

use crate::error::Result;
use crate::expression;
use crate::partition::PartitionValues;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// One row, keyed by column name.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl DataFrame {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self { columns, rows }
    }

    /// Builds a frame from rows, deriving the column list from their keys.
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for row in &rows {
            for key in row.keys() {
                if seen.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn union(mut self, other: DataFrame) -> DataFrame {
        for col in other.columns {
            if !self.columns.contains(&col) {
                self.columns.push(col);
            }
        }
        self.rows.extend(other.rows);
        self
    }

    /// Keeps rows matching any of the given partition-value records.
    /// An empty record list keeps everything.
    pub fn filter_partitions(&self, partition_values: &[PartitionValues]) -> DataFrame {
        if partition_values.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|row| partition_values.iter().any(|pv| pv.matches_record(row)))
            .cloned()
            .collect();
        DataFrame {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Keeps rows for which the boolean expression evaluates true. The row
    /// itself is the expression context, so `rating > 3` filters on the
    /// `rating` column.
    pub fn filter_expr(&self, expr: &str) -> Result<DataFrame> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let ctx = Value::Object(row.clone());
            if expression::evaluate_bool(expr, &ctx)? {
                rows.push(row.clone());
            }
        }
        Ok(DataFrame {
            columns: self.columns.clone(),
            rows,
        })
    }

    pub fn column_values(&self, col: &str) -> Vec<Value> {
        self.rows
            .iter()
            .filter_map(|row| row.get(col).cloned())
            .collect()
    }

    /// Largest value of a column under scalar ordering, `None` when the
    /// column is absent or the frame is empty.
    pub fn max_value(&self, col: &str) -> Option<Value> {
        self.column_values(col)
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| cmp_scalars(a, b))
    }
}

/// Total ordering over JSON scalars: numbers numerically, strings
/// lexicographically, booleans below numbers, null below everything.
pub fn cmp_scalars(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Renders a scalar as an expression literal, quoting strings.
pub fn scalar_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}
