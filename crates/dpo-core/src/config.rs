//! Pipeline configuration loaded from YAML.
//!
//! A [`PipelineConfig`] is the blueprint of a pipeline: connections, data
//! objects and actions, plus global scheduler settings. Specs are plain
//! serde structs with internally tagged enums for the polymorphic parts;
//! turning them into live instances is the io crate's job.
//!
//! # Example
//!
//! ```yaml
//! global:
//!   parallelism: 2
//! data_objects:
//!   - type: json_table
//!     id: src
//!     path: data/src
//!     partition_columns: [dt]
//!   - type: json_table
//!     id: tgt
//!     path: data/tgt
//!     partition_columns: [dt]
//! actions:
//!   - id: copy
//!     feed: ingest
//!     inputs: [src]
//!     outputs: [tgt]
//!     execution_mode:
//!       type: partition_diff
//! ```

use crate::dataobject::SaveMode;
use crate::error::{DpoError, Result};
use crate::execmode::ExecutionMode;
use crate::state::RetentionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub data_objects: Vec<DataObjectSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| DpoError::config(format!("invalid pipeline config: {}", e)))
    }

    /// Merges a second configuration file into this one. Lists append,
    /// global settings from `other` win where set.
    pub fn merge(mut self, other: PipelineConfig) -> PipelineConfig {
        self.connections.extend(other.connections);
        self.data_objects.extend(other.data_objects);
        self.actions.extend(other.actions);
        self.global = self.global.merge(other.global);
        self
    }

    /// Stable digest of the configuration, recorded in state files.
    pub fn digest(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(self).unwrap_or_default().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub continue_on_failure: Option<bool>,
    #[serde(default)]
    pub action_timeout_sec: Option<u64>,
    #[serde(default)]
    pub state_retention: Option<RetentionConfig>,
}

impl GlobalConfig {
    fn merge(self, other: GlobalConfig) -> GlobalConfig {
        GlobalConfig {
            parallelism: other.parallelism.or(self.parallelism),
            continue_on_failure: other.continue_on_failure.or(self.continue_on_failure),
            action_timeout_sec: other.action_timeout_sec.or(self.action_timeout_sec),
            state_retention: other.state_retention.or(self.state_retention),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionSpec {
    LocalFs(LocalFsConnectionSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFsConnectionSpec {
    pub id: String,
    /// Base directory; may be a `PROVIDER#KEY` secret reference.
    pub base_path: String,
    #[serde(default)]
    pub max_pool_size: Option<usize>,
    #[serde(default)]
    pub max_idle_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataObjectSpec {
    MemTable(MemTableSpec),
    JsonTable(JsonTableSpec),
    MemStream(MemStreamSpec),
}

impl DataObjectSpec {
    pub fn id(&self) -> &str {
        match self {
            DataObjectSpec::MemTable(spec) => &spec.id,
            DataObjectSpec::JsonTable(spec) => &spec.id,
            DataObjectSpec::MemStream(spec) => &spec.id,
        }
    }
}

/// In-memory partitioned table, mostly used for tests and staging data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemTableSpec {
    pub id: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub save_mode: SaveMode,
    /// Enables merge writes when non-empty.
    #[serde(default)]
    pub primary_key: Vec<String>,
}

/// Newline-delimited JSON files under hive-style partition directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTableSpec {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub save_mode: SaveMode,
}

/// In-memory micro-batch stream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemStreamSpec {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub recursive_inputs: Vec<String>,
    #[serde(default)]
    pub main_input_id: Option<String>,
    #[serde(default)]
    pub main_output_id: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub execution_condition: Option<String>,
    #[serde(default)]
    pub fail_condition: Option<String>,
    /// Label matched by the CLI feed selector.
    pub feed: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub transformers: Vec<TransformerSpec>,
    #[serde(default)]
    pub inputs_to_ignore_filter: Vec<String>,
    #[serde(default = "default_true")]
    pub handle_recursive_inputs_as_subfeeds: bool,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub runtime_options: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerSpec {
    /// Keep rows for which the condition holds; the row is the expression
    /// context and `%{option}` tokens are substituted first.
    FilterRows {
        #[serde(default)]
        subfeed: Option<String>,
        condition: String,
    },
    /// Transformation registered by name in the instance registry.
    Custom {
        name: String,
        #[serde(default)]
        subfeed: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_pipeline_config() {
        let yaml = r#"
global:
  parallelism: 3
connections:
  - type: local_fs
    id: data
    base_path: /tmp/data
data_objects:
  - type: json_table
    id: src
    path: src
    connection_id: data
    partition_columns: [dt, type]
  - type: mem_table
    id: tgt
    save_mode: merge
    primary_key: [type, lastname, firstname]
actions:
  - id: copy
    feed: ingest
    inputs: [src]
    outputs: [tgt]
    execution_mode:
      type: partition_diff
      partition_col_nb: 1
    transformers:
      - type: filter_rows
        condition: "rating > 3"
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.global.parallelism, Some(3));
        assert_eq!(config.data_objects.len(), 2);
        assert_eq!(config.data_objects[0].id(), "src");
        let action = &config.actions[0];
        assert!(action.handle_recursive_inputs_as_subfeeds);
        assert!(matches!(
            action.execution_mode,
            Some(ExecutionMode::PartitionDiff(_))
        ));
        assert_eq!(action.transformers.len(), 1);
    }

    #[test]
    fn merge_appends_lists_and_overrides_globals() {
        let a = PipelineConfig::from_yaml("global:\n  parallelism: 1\nactions: []").unwrap();
        let b = PipelineConfig::from_yaml(
            "global:\n  continue_on_failure: true\ndata_objects:\n  - type: mem_table\n    id: t\n",
        )
        .unwrap();
        let merged = a.merge(b);
        assert_eq!(merged.global.parallelism, Some(1));
        assert_eq!(merged.global.continue_on_failure, Some(true));
        assert_eq!(merged.data_objects.len(), 1);
    }

    #[test]
    fn digest_is_stable_and_sensitive_to_changes() {
        let a = PipelineConfig::from_yaml("actions: []").unwrap();
        let b = PipelineConfig::from_yaml("actions: []").unwrap();
        assert_eq!(a.digest(), b.digest());
        let c = PipelineConfig::from_yaml("global:\n  parallelism: 9").unwrap();
        assert_ne!(a.digest(), c.digest());
    }
}
