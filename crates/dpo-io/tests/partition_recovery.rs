//! Partition filter plus recovery: a two-action pipeline where the second
//! action fails, then succeeds on the next attempt with the first action's
//! results replayed.

mod common;

use common::{failing_transformer, identity_transformer, rows};
use dpo_core::state::ActionState;
use dpo_core::{
    Action, ActionId, DataObjectId, Driver, DriverConfig, InstanceRegistry, PartitionValues,
};
use dpo_io::MemTable;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn partitioned(id: &str) -> MemTable {
    MemTable::new(id).with_partition_columns(vec!["dt".to_string(), "type".to_string()])
}

struct Pipeline {
    registry: Arc<InstanceRegistry>,
    src: Arc<MemTable>,
    tgt1: Arc<MemTable>,
    tgt2: Arc<MemTable>,
}

fn pipeline() -> Pipeline {
    let src = Arc::new(partitioned("src"));
    src.insert_rows(rows(json!([
        {"dt": "20180101", "type": "person", "rating": 5},
        {"dt": "20190101", "type": "company", "rating": 10}
    ])));
    let tgt1 = Arc::new(partitioned("tgt1"));
    let tgt2 = Arc::new(partitioned("tgt2"));

    let mut registry = InstanceRegistry::new();
    registry.register_data_object(src.clone()).unwrap();
    registry.register_data_object(tgt1.clone()).unwrap();
    registry.register_data_object(tgt2.clone()).unwrap();
    Pipeline {
        registry: Arc::new(registry),
        src,
        tgt1,
        tgt2,
    }
}

fn copy_action(id: &str, input: &str, output: &str) -> Action {
    Action::new(
        id,
        vec![DataObjectId::new(input)],
        vec![DataObjectId::new(output)],
        "test",
    )
}

#[tokio::test]
async fn failed_attempt_is_recovered_exactly_where_it_stopped() {
    let pipeline = pipeline();
    let state_dir = TempDir::new().unwrap();

    let actions = vec![
        Arc::new(copy_action("a", "src", "tgt1")),
        Arc::new(copy_action("b", "tgt1", "tgt2").with_transformer(failing_transformer())),
    ];
    let config = DriverConfig::new("recovery-app", "test")
        .with_partition_values(vec![PartitionValues::single("dt", "20180101")])
        .with_state_path(state_dir.path());
    let outcome = Driver::new(config, pipeline.registry.clone(), actions).run().await;

    assert_eq!(outcome.exit_code, 2);
    let state = outcome.state.expect("state");
    assert_eq!((state.run_id, state.attempt_id), (1, 1));
    assert_eq!(state.actions_state[&ActionId::new("a")].state, ActionState::Succeeded);
    assert_eq!(state.actions_state[&ActionId::new("b")].state, ActionState::Failed);

    // the partition filter kept the 2019 partition out of tgt1 and the
    // failure kept tgt2 empty
    let tgt1_rows = pipeline.tgt1.rows();
    assert_eq!(tgt1_rows.len(), 1);
    assert_eq!(tgt1_rows[0]["rating"], 5);
    assert!(pipeline.tgt2.rows().is_empty());

    // second invocation with the transformation fixed and no partition
    // filter: only b re-executes, replaying a's selection
    let actions = vec![
        Arc::new(copy_action("a", "src", "tgt1")),
        Arc::new(copy_action("b", "tgt1", "tgt2").with_transformer(identity_transformer())),
    ];
    let config = DriverConfig::new("recovery-app", "test").with_state_path(state_dir.path());
    let outcome = Driver::new(config, pipeline.registry.clone(), actions).run().await;

    assert_eq!(outcome.exit_code, 0);
    let state = outcome.state.expect("state");
    assert_eq!((state.run_id, state.attempt_id), (1, 2));
    assert_eq!(state.actions_state[&ActionId::new("a")].state, ActionState::Succeeded);
    assert_eq!(state.actions_state[&ActionId::new("b")].state, ActionState::Succeeded);

    let tgt2_rows = pipeline.tgt2.rows();
    assert_eq!(tgt2_rows.len(), 1);
    assert_eq!(tgt2_rows[0]["rating"], 5);
    // tgt1 is untouched by the recovery attempt
    assert_eq!(pipeline.tgt1.rows().len(), 1);
}

#[tokio::test]
async fn a_fresh_run_follows_a_fully_succeeded_one() {
    let pipeline = pipeline();
    let state_dir = TempDir::new().unwrap();
    let actions = vec![Arc::new(copy_action("a", "src", "tgt1"))];

    let config = DriverConfig::new("fresh-app", "test").with_state_path(state_dir.path());
    let outcome = Driver::new(config, pipeline.registry.clone(), actions.clone())
        .run()
        .await;
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.state.as_ref().unwrap().run_id, 1);

    let config = DriverConfig::new("fresh-app", "test").with_state_path(state_dir.path());
    let outcome = Driver::new(config, pipeline.registry.clone(), actions).run().await;
    assert_eq!(outcome.exit_code, 0);
    let state = outcome.state.unwrap();
    assert_eq!((state.run_id, state.attempt_id), (2, 1));
}
