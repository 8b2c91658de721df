//! Partition-value algebra.
//!
//! A [`PartitionValues`] record maps partition-column names to string values,
//! e.g. `dt=20180101/type=person`. Execution modes compute sets of these
//! records to decide which slices of a data object an action processes, and
//! subfeeds carry them along DAG edges. Records are value types: every
//! operation returns a new record, nothing is mutated in place.

use crate::error::{DpoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ordered mapping of partition-column name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionValues {
    elements: BTreeMap<String, String>,
}

impl PartitionValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(col: impl Into<String>, value: impl Into<String>) -> Self {
        let mut elements = BTreeMap::new();
        elements.insert(col.into(), value.into());
        Self { elements }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            elements: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, col: impl Into<String>, value: impl Into<String>) -> Self {
        self.elements.insert(col.into(), value.into());
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn key_set(&self) -> BTreeSet<&str> {
        self.keys().collect()
    }

    pub fn get(&self, col: &str) -> Option<&str> {
        self.elements.get(col).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.elements
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keeps only the entries whose key is listed in `columns`.
    pub fn project(&self, columns: &[String]) -> PartitionValues {
        PartitionValues {
            elements: self
                .elements
                .iter()
                .filter(|(k, _)| columns.iter().any(|c| c == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// True when every entry of `self` is present in `other` with an equal value.
    pub fn is_included_in(&self, other: &PartitionValues) -> bool {
        self.elements
            .iter()
            .all(|(k, v)| other.get(k) == Some(v.as_str()))
    }

    /// Matches a row against this record. Row values are compared by their
    /// string rendering so numeric partition columns behave like strings.
    pub fn matches_record(&self, record: &serde_json::Map<String, Value>) -> bool {
        self.elements.iter().all(|(k, v)| {
            record
                .get(k)
                .map(|rv| value_as_string(rv) == *v)
                .unwrap_or(false)
        })
    }

    /// Renders this record into a JSON object, used by expression contexts.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.elements
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl fmt::Display for PartitionValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.elements {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Renders a JSON scalar the way partition directories do.
pub fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Projects every record onto `columns`, dropping records that end up empty
/// and deduplicating the survivors while preserving order.
pub fn project_all(values: &[PartitionValues], columns: &[String]) -> Vec<PartitionValues> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for pv in values {
        let projected = pv.project(columns);
        if projected.is_empty() {
            continue;
        }
        if seen.insert(projected.clone()) {
            out.push(projected);
        }
    }
    out
}

/// Set difference `left \ right`, preserving the order of `left`.
pub fn partition_diff(left: &[PartitionValues], right: &[PartitionValues]) -> Vec<PartitionValues> {
    let existing: BTreeSet<&PartitionValues> = right.iter().collect();
    left.iter()
        .filter(|pv| !existing.contains(pv))
        .cloned()
        .collect()
}

/// Parses the single-column CLI form `COL=V1,V2,...` into one record per value.
pub fn parse_single_col(arg: &str) -> Result<Vec<PartitionValues>> {
    let (col, values) = arg
        .split_once('=')
        .ok_or_else(|| DpoError::config(format!("expected COL=V1,V2 but got '{}'", arg)))?;
    let col = col.trim();
    if col.is_empty() {
        return Err(DpoError::config(format!("empty partition column in '{}'", arg)));
    }
    values
        .split(',')
        .map(|v| {
            let v = v.trim();
            if v.is_empty() {
                Err(DpoError::config(format!("empty partition value in '{}'", arg)))
            } else {
                Ok(PartitionValues::single(col, v))
            }
        })
        .collect()
}

/// Parses the multi-column CLI form `COL1=V,COL2=V;COL1=W,COL2=W` into one
/// record per `;`-separated group.
pub fn parse_multi(arg: &str) -> Result<Vec<PartitionValues>> {
    arg.split(';')
        .filter(|group| !group.trim().is_empty())
        .map(|group| {
            let mut pv = PartitionValues::new();
            for entry in group.split(',') {
                let (col, value) = entry.split_once('=').ok_or_else(|| {
                    DpoError::config(format!("expected COL=V but got '{}'", entry))
                })?;
                pv = pv.with(col.trim(), value.trim());
            }
            if pv.is_empty() {
                return Err(DpoError::config(format!("empty partition group in '{}'", arg)));
            }
            Ok(pv)
        })
        .collect()
}
