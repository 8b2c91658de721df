//! Turns a parsed [`PipelineConfig`] into live instances.
//!
//! Connections are built first so data objects can reference them, then the
//! data objects, then the actions with their transformer chains. Custom
//! transformers and execution modes must already be registered on the
//! registry passed in; configuration files reference them by name.

use dpo_core::action::{Action, ActionMetadata};
use dpo_core::config::{
    ActionSpec, ConnectionSpec, DataObjectSpec, PipelineConfig, TransformerSpec,
};
use dpo_core::expression;
use dpo_core::frame::DataFrame;
use dpo_core::registry::CustomTransformer;
use dpo_core::transform::{TransformerChain, TransformerContext, TransformerLink};
use dpo_core::{DataObjectId, DpoError, InstanceRegistry, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::fs_connection::LocalFsConnection;
use crate::json_table::JsonFileTable;
use crate::mem_stream::MemStream;
use crate::mem_table::MemTable;

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_MAX_IDLE_SEC: u64 = 600;

pub struct Instances {
    pub registry: Arc<InstanceRegistry>,
    pub actions: Vec<Arc<Action>>,
}

pub fn build_instances(
    config: &PipelineConfig,
    mut registry: InstanceRegistry,
) -> Result<Instances> {
    let mut fs_connections: HashMap<String, Arc<LocalFsConnection>> = HashMap::new();
    for spec in &config.connections {
        match spec {
            ConnectionSpec::LocalFs(spec) => {
                let base_path = registry.secrets().resolve(&spec.base_path)?;
                let connection = Arc::new(LocalFsConnection::new(
                    spec.id.as_str(),
                    base_path,
                    spec.max_pool_size.unwrap_or(DEFAULT_POOL_SIZE),
                    Duration::from_secs(spec.max_idle_sec.unwrap_or(DEFAULT_MAX_IDLE_SEC)),
                ));
                registry.register_connection(connection.clone())?;
                fs_connections.insert(spec.id.clone(), connection);
            }
        }
    }

    for spec in &config.data_objects {
        match spec {
            DataObjectSpec::MemTable(spec) => {
                registry.register_data_object(Arc::new(MemTable::from_spec(spec)))?;
            }
            DataObjectSpec::JsonTable(spec) => {
                let connection = match &spec.connection_id {
                    Some(id) => Some(
                        fs_connections
                            .get(id)
                            .cloned()
                            .ok_or_else(|| {
                                DpoError::config(format!(
                                    "data object '{}' references unknown connection '{}'",
                                    spec.id, id
                                ))
                            })?,
                    ),
                    None => None,
                };
                registry
                    .register_data_object(Arc::new(JsonFileTable::from_spec(spec, connection)))?;
            }
            DataObjectSpec::MemStream(spec) => {
                registry.register_data_object(Arc::new(MemStream::new(spec.id.as_str())))?;
            }
        }
    }

    let mut actions = Vec::with_capacity(config.actions.len());
    for spec in &config.actions {
        actions.push(Arc::new(build_action(spec, &registry)?));
    }

    info!(
        connections = config.connections.len(),
        data_objects = config.data_objects.len(),
        actions = actions.len(),
        "instances built"
    );
    Ok(Instances {
        registry: Arc::new(registry),
        actions,
    })
}

fn build_action(spec: &ActionSpec, registry: &InstanceRegistry) -> Result<Action> {
    let mut links = Vec::new();
    for transformer in &spec.transformers {
        links.push(build_transformer(transformer, registry)?);
    }
    let transformer = TransformerChain {
        links,
        options: spec.options.clone(),
        runtime_options: spec.runtime_options.clone(),
    };

    Ok(Action {
        id: spec.id.as_str().into(),
        inputs: spec.inputs.iter().map(DataObjectId::new).collect(),
        outputs: spec.outputs.iter().map(DataObjectId::new).collect(),
        recursive_inputs: spec
            .recursive_inputs
            .iter()
            .map(DataObjectId::new)
            .collect(),
        main_input_id: spec.main_input_id.as_deref().map(DataObjectId::new),
        main_output_id: spec.main_output_id.as_deref().map(DataObjectId::new),
        execution_mode: spec.execution_mode.clone(),
        execution_condition: spec.execution_condition.clone(),
        fail_condition: spec.fail_condition.clone(),
        metadata: ActionMetadata {
            feed: spec.feed.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
        },
        transformer,
        inputs_to_ignore_filter: spec
            .inputs_to_ignore_filter
            .iter()
            .map(DataObjectId::new)
            .collect(),
        handle_recursive_inputs_as_subfeeds: spec.handle_recursive_inputs_as_subfeeds,
        partition_values_transform: None,
    })
}

fn build_transformer(
    spec: &TransformerSpec,
    registry: &InstanceRegistry,
) -> Result<TransformerLink> {
    match spec {
        TransformerSpec::FilterRows { subfeed, condition } => {
            let condition = condition.clone();
            let name = format!("filter({})", condition);
            Ok(TransformerLink::OneToOne {
                name,
                subfeed: subfeed.clone(),
                func: Arc::new(move |ctx: &TransformerContext, df: DataFrame| {
                    let options: serde_json::Map<String, Value> = ctx
                        .options
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect();
                    let resolved =
                        expression::substitute_tokens(&condition, &Value::Object(options))?;
                    df.filter_expr(&resolved)
                }),
            })
        }
        TransformerSpec::Custom { name, subfeed } => match registry.transformer(name)? {
            CustomTransformer::OneToOne(func) => Ok(TransformerLink::OneToOne {
                name: name.clone(),
                subfeed: subfeed.clone(),
                func: Arc::clone(func),
            }),
            CustomTransformer::ManyToMany(func) => Ok(TransformerLink::ManyToMany {
                name: name.clone(),
                func: Arc::clone(func),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_instances_from_yaml() {
        let yaml = r#"
connections:
  - type: local_fs
    id: data
    base_path: /tmp/dpo-builder-test
data_objects:
  - type: json_table
    id: src
    path: src
    connection_id: data
    partition_columns: [dt]
  - type: mem_table
    id: tgt
actions:
  - id: copy
    feed: ingest
    inputs: [src]
    outputs: [tgt]
    transformers:
      - type: filter_rows
        condition: "rating > %{min_rating}"
    options:
      min_rating: "3"
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let instances = build_instances(&config, InstanceRegistry::new()).unwrap();
        assert_eq!(instances.actions.len(), 1);
        assert!(instances
            .registry
            .data_object(&DataObjectId::new("src"))
            .is_ok());
        assert!(instances
            .registry
            .connection(&"data".into())
            .is_ok());
    }

    #[test]
    fn unknown_connection_reference_is_rejected() {
        let yaml = r#"
data_objects:
  - type: json_table
    id: src
    path: src
    connection_id: nope
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert!(build_instances(&config, InstanceRegistry::new()).is_err());
    }

    #[test]
    fn unknown_custom_transformer_is_rejected() {
        let yaml = r#"
data_objects:
  - type: mem_table
    id: src
  - type: mem_table
    id: tgt
actions:
  - id: a
    feed: f
    inputs: [src]
    outputs: [tgt]
    transformers:
      - type: custom
        name: not-registered
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert!(build_instances(&config, InstanceRegistry::new()).is_err());
    }
}
