//! Per-run metrics accumulation.
//!
//! Each action records metrics per output while it executes; the scheduler
//! merges them into the run state when the action completes. Keys are
//! prefixed with the output id when an action has more than one output.

use crate::id::{ActionId, DataObjectId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
pub struct MetricsCollector {
    entries: Mutex<HashMap<ActionId, Vec<(DataObjectId, BTreeMap<String, Value>)>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        action_id: &ActionId,
        output_id: &DataObjectId,
        metrics: BTreeMap<String, Value>,
    ) {
        self.entries
            .lock()
            .expect("metrics collector poisoned")
            .entry(action_id.clone())
            .or_default()
            .push((output_id.clone(), metrics));
    }

    /// Merged metrics for one action. Keys stay plain for a single output
    /// and are prefixed with the output id otherwise.
    pub fn merged_for_action(&self, action_id: &ActionId) -> BTreeMap<String, Value> {
        let entries = self.entries.lock().expect("metrics collector poisoned");
        let Some(per_output) = entries.get(action_id) else {
            return BTreeMap::new();
        };
        let mut merged = BTreeMap::new();
        let single = per_output.len() == 1;
        for (output_id, metrics) in per_output {
            for (key, value) in metrics {
                let merged_key = if single {
                    key.clone()
                } else {
                    format!("{}.{}", output_id, key)
                };
                merged.insert(merged_key, value.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_output_metrics_keep_plain_keys() {
        let collector = MetricsCollector::new();
        let action = ActionId::new("a");
        collector.record(
            &action,
            &DataObjectId::new("tgt"),
            BTreeMap::from([("rows_inserted".to_string(), Value::from(2))]),
        );
        let merged = collector.merged_for_action(&action);
        assert_eq!(merged["rows_inserted"], Value::from(2));
    }

    #[test]
    fn multiple_outputs_are_prefixed() {
        let collector = MetricsCollector::new();
        let action = ActionId::new("a");
        for output in ["t1", "t2"] {
            collector.record(
                &action,
                &DataObjectId::new(output),
                BTreeMap::from([("rows_inserted".to_string(), Value::from(1))]),
            );
        }
        let merged = collector.merged_for_action(&action);
        assert!(merged.contains_key("t1.rows_inserted"));
        assert!(merged.contains_key("t2.rows_inserted"));
    }
}
