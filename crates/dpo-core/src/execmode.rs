//! Execution modes decide which data an action processes.
//!
//! A mode is applied once per run during the init phase and returns an
//! optional [`ModeResult`]: the partition values to process, an optional row
//! filter and ancillary options. `None` means pass-through, the incoming
//! subfeed is left untouched. The action kernel rewrites the main input
//! subfeed uniformly from the result, so modes never touch subfeeds
//! themselves. Results are cached in the run context and replayed verbatim
//! on recovery attempts.
//!
//! `post_exec` is the only hook that sees the main input and output subfeed
//! after writing; the streaming mode uses it to advance its checkpoint.

use crate::dataobject::{
    require_partitioned, require_readable, require_streamable, CanHandlePartitions, CanRead,
    DataObject,
};
use crate::error::{DpoError, Result};
use crate::expression;
use crate::frame::scalar_literal;
use crate::id::{ActionId, DataObjectId};
use crate::partition::{self, PartitionValues};
use crate::registry::InstanceRegistry;
use crate::subfeed::SubFeed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Option key under which the kernel records the checkpoint to persist.
pub const OPT_CHECKPOINT_NEXT: &str = "checkpoint_next";
/// Option key exposing the checkpoint a streaming read starts from.
pub const OPT_CHECKPOINT: &str = "checkpoint";
/// Option key exposing the high-water-mark an incremental load starts from.
pub const OPT_HIGH_WATER_MARK: &str = "high_water_mark";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Process the partition values supplied by the driver, or the explicit
    /// values configured here. Without either, no filter is applied.
    FixedPartitionValues {
        #[serde(default)]
        partition_values: Vec<PartitionValues>,
    },
    /// Process the partitions present in the main input but missing in the
    /// main output (or an alternative output).
    PartitionDiff(PartitionDiffMode),
    /// Select input rows newer than the maximum of `compare_col` already
    /// present in the main output.
    Incremental { compare_col: String },
    /// Run one micro-batch from a streaming main input, persisting the
    /// checkpoint under the configured location.
    StreamingOnce { checkpoint_location: String },
    /// Abort when the incoming subfeed carries no partition values.
    FailIfNoPartitionValues,
    /// Clear any incoming partition values and filter: a full reload.
    ProcessAll,
    /// User-supplied mode resolved from the instance registry.
    Custom { name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionDiffMode {
    /// Restrict the diff to the first n partition columns of the main input.
    #[serde(default)]
    pub partition_col_nb: Option<usize>,
    /// Compare against this data object instead of the main output.
    #[serde(default)]
    pub alternative_output_id: Option<DataObjectId>,
    /// Boolean expression gating whether the mode is used at all.
    #[serde(default)]
    pub apply_condition: Option<String>,
    /// Boolean expression aborting the run when true for the selection.
    #[serde(default)]
    pub fail_condition: Option<String>,
    /// Boolean expression filtering the candidate partitions, evaluated per
    /// candidate with its record bound to `partition_values`.
    #[serde(default)]
    pub select_expression: Option<String>,
}

/// Partition values and row filter selected by a mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeResult {
    #[serde(default)]
    pub partition_values: Vec<PartitionValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ModeResult {
    pub fn from_partition_values(partition_values: Vec<PartitionValues>) -> Self {
        Self {
            partition_values,
            ..Self::default()
        }
    }
}

/// Everything a mode may look at when computing its result.
pub struct ModeInput<'a> {
    pub action_id: &'a ActionId,
    pub main_input: &'a Arc<dyn DataObject>,
    pub main_output: &'a Arc<dyn DataObject>,
    pub subfeed: &'a SubFeed,
    pub context_doc: &'a Value,
    pub registry: &'a InstanceRegistry,
    /// Partition values given on the command line.
    pub app_partition_values: &'a [PartitionValues],
}

/// User-supplied execution mode, registered by name.
pub trait CustomPartitionMode: Send + Sync {
    fn apply(&self, input: &ModeInput<'_>) -> Result<Option<ModeResult>>;
}

impl ExecutionMode {
    pub async fn apply(&self, input: &ModeInput<'_>) -> Result<Option<ModeResult>> {
        match self {
            ExecutionMode::FixedPartitionValues { partition_values } => {
                let values = if partition_values.is_empty() {
                    input.app_partition_values.to_vec()
                } else {
                    partition_values.clone()
                };
                if values.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ModeResult::from_partition_values(values)))
                }
            }
            ExecutionMode::PartitionDiff(mode) => mode.apply(input).await,
            ExecutionMode::Incremental { compare_col } => {
                apply_incremental(compare_col, input).await
            }
            ExecutionMode::StreamingOnce {
                checkpoint_location,
            } => {
                require_streamable(input.main_input)?;
                let mut options = BTreeMap::new();
                if let Some(checkpoint) = read_checkpoint(checkpoint_location) {
                    options.insert(OPT_CHECKPOINT.to_string(), checkpoint);
                }
                Ok(Some(ModeResult {
                    partition_values: input.subfeed.partition_values.clone(),
                    filter: None,
                    options,
                }))
            }
            ExecutionMode::FailIfNoPartitionValues => {
                if input.subfeed.partition_values.is_empty() {
                    Err(DpoError::precondition(
                        input.action_id,
                        "no partition values given but the action requires them",
                    ))
                } else {
                    Ok(None)
                }
            }
            ExecutionMode::ProcessAll => Ok(Some(ModeResult::default())),
            ExecutionMode::Custom { name } => {
                let custom = input.registry.custom_mode(name)?;
                custom.apply(input)
            }
        }
    }

    /// Invoked after the main output has been written. Sees the final main
    /// input and output subfeeds of the attempt.
    pub async fn post_exec(
        &self,
        mode_result: Option<&ModeResult>,
        _main_input_subfeed: &SubFeed,
        _main_output_subfeed: &SubFeed,
    ) -> Result<()> {
        if let ExecutionMode::StreamingOnce {
            checkpoint_location,
        } = self
        {
            if let Some(next) = mode_result.and_then(|r| r.options.get(OPT_CHECKPOINT_NEXT)) {
                if let Some(parent) = Path::new(checkpoint_location).parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| anyhow::anyhow!("creating checkpoint dir: {}", e))?;
                }
                std::fs::write(checkpoint_location, next)
                    .map_err(|e| anyhow::anyhow!("writing checkpoint: {}", e))?;
                debug!(checkpoint = %next, location = %checkpoint_location, "advanced checkpoint");
            }
        }
        Ok(())
    }
}

impl PartitionDiffMode {
    async fn apply(&self, input: &ModeInput<'_>) -> Result<Option<ModeResult>> {
        if let Some(condition) = &self.apply_condition {
            if !expression::evaluate_bool(condition, input.context_doc)? {
                debug!(action = %input.action_id, "apply condition false, mode not used");
                return Ok(None);
            }
        }

        let input_partitions = require_partitioned(input.main_input)?
            .list_partitions()
            .await?;
        let output_object: Arc<dyn DataObject> = match &self.alternative_output_id {
            Some(id) => Arc::clone(input.registry.data_object(id)?),
            None => Arc::clone(input.main_output),
        };
        let existing = require_partitioned(&output_object)?
            .list_partitions()
            .await?;

        let mut columns = input.main_input.partition_columns();
        if let Some(n) = self.partition_col_nb {
            columns.truncate(n);
        }
        let candidates = partition::project_all(&input_partitions, &columns);
        let existing = partition::project_all(&existing, &columns);
        let mut selected = partition::partition_diff(&candidates, &existing);

        if let Some(select) = &self.select_expression {
            let mut kept = Vec::new();
            for pv in selected {
                let doc = doc_with(input.context_doc, "partition_values", pv.to_json());
                if expression::evaluate_bool(select, &doc)? {
                    kept.push(pv);
                }
            }
            selected = kept;
        }

        if let Some(condition) = &self.fail_condition {
            let doc = doc_with(
                input.context_doc,
                "selected_partition_values",
                pvs_json(&selected),
            );
            let doc = doc_with(&doc, "input_partition_values", pvs_json(&candidates));
            let doc = doc_with(&doc, "output_partition_values", pvs_json(&existing));
            if expression::evaluate_bool(condition, &doc)? {
                return Err(DpoError::task(
                    input.action_id.clone(),
                    anyhow::anyhow!(
                        "fail condition '{}' evaluated true for selected partitions [{}]",
                        condition,
                        join_pvs(&selected)
                    ),
                ));
            }
        }

        if selected.is_empty() {
            return Err(DpoError::NoDataDontStop {
                action_id: input.action_id.clone(),
            });
        }
        selected.sort();
        debug!(action = %input.action_id, selected = %join_pvs(&selected), "partition diff selected");
        Ok(Some(ModeResult::from_partition_values(selected)))
    }
}

async fn apply_incremental(compare_col: &str, input: &ModeInput<'_>) -> Result<Option<ModeResult>> {
    let existing = require_readable(input.main_output)?.read(&[], None).await?;
    let Some(high_water_mark) = existing.max_value(compare_col) else {
        // empty output, select everything
        return Ok(None);
    };
    let filter = format!("{} > {}", compare_col, scalar_literal(&high_water_mark));
    let mut options = BTreeMap::new();
    options.insert(
        OPT_HIGH_WATER_MARK.to_string(),
        partition::value_as_string(&high_water_mark),
    );
    Ok(Some(ModeResult {
        partition_values: input.subfeed.partition_values.clone(),
        filter: Some(filter),
        options,
    }))
}

fn read_checkpoint(location: &str) -> Option<String> {
    match std::fs::read_to_string(location) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn pvs_json(values: &[PartitionValues]) -> Value {
    Value::Array(values.iter().map(|pv| pv.to_json()).collect())
}

fn join_pvs(values: &[PartitionValues]) -> String {
    values
        .iter()
        .map(|pv| pv.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn doc_with(doc: &Value, key: &str, value: Value) -> Value {
    let mut map = match doc {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn modes_deserialize_from_tagged_yaml() {
        let mode: ExecutionMode = serde_yaml::from_str(
            "type: partition_diff\npartition_col_nb: 1\nfail_condition: \"size(selected_partition_values) > 10\"\n",
        )
        .unwrap();
        match mode {
            ExecutionMode::PartitionDiff(diff) => {
                assert_eq!(diff.partition_col_nb, Some(1));
                assert!(diff.fail_condition.is_some());
            }
            other => panic!("unexpected mode {:?}", other),
        }

        let mode: ExecutionMode = serde_yaml::from_str("type: process_all").unwrap();
        assert!(matches!(mode, ExecutionMode::ProcessAll));
    }

    #[test]
    fn process_all_clears_the_selection() {
        let result = ModeResult::default();
        assert!(result.partition_values.is_empty());
        assert!(result.filter.is_none());
    }

    #[test]
    fn doc_with_extends_without_mutating() {
        let base = json!({"run_id": 1});
        let extended = doc_with(&base, "extra", json!(true));
        assert_eq!(base, json!({"run_id": 1}));
        assert_eq!(extended["extra"], json!(true));
    }
}
