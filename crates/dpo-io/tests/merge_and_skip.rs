//! Merge save mode through the driver, and skip propagation from a mode
//! deciding there is nothing to process.

mod common;

use common::rows;
use dpo_core::dataobject::SaveMode;
use dpo_core::execmode::{ExecutionMode, PartitionDiffMode};
use dpo_core::state::ActionState;
use dpo_core::{Action, ActionId, DataObjectId, Driver, DriverConfig, InstanceRegistry};
use dpo_io::MemTable;
use serde_json::json;
use std::sync::Arc;

fn copy(id: &str, input: &str, output: &str, feed: &str) -> Arc<Action> {
    Arc::new(Action::new(
        id,
        vec![DataObjectId::new(input)],
        vec![DataObjectId::new(output)],
        feed,
    ))
}

#[tokio::test]
async fn merge_save_mode_upserts_by_primary_key() {
    let src = Arc::new(MemTable::new("src"));
    src.insert_rows(rows(json!([
        {"type": "ext", "lastname": "doe", "firstname": "john", "rating": 5},
        {"type": "ext", "lastname": "smith", "firstname": "peter", "rating": 3}
    ])));
    let tgt = Arc::new(
        MemTable::new("tgt")
            .with_save_mode(SaveMode::Merge)
            .with_primary_key(vec![
                "type".to_string(),
                "lastname".to_string(),
                "firstname".to_string(),
            ]),
    );

    let mut registry = InstanceRegistry::new();
    registry.register_data_object(src.clone()).unwrap();
    registry.register_data_object(tgt.clone()).unwrap();
    let registry = Arc::new(registry);
    let actions = vec![copy("merge", "src", "tgt", "merge")];

    let config = DriverConfig::new("merge-app", "merge");
    let outcome = Driver::new(config, registry.clone(), actions.clone()).run().await;
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(tgt.rows().len(), 2);

    // one updated row and one new row
    src.clear();
    src.insert_rows(rows(json!([
        {"type": "ext", "lastname": "doe", "firstname": "john", "rating": 10},
        {"type": "int", "lastname": "brown", "firstname": "emma", "rating": 7}
    ])));

    let config = DriverConfig::new("merge-app", "merge");
    let outcome = Driver::new(config, registry, actions).run().await;
    assert_eq!(outcome.exit_code, 0);

    let rows = tgt.rows();
    assert_eq!(rows.len(), 3);
    let doe = rows.iter().find(|r| r["lastname"] == "doe").unwrap();
    assert_eq!(doe["rating"], 10);
}

#[tokio::test]
async fn no_data_to_process_skips_the_downstream_action() {
    let src = Arc::new(MemTable::new("src").with_partition_columns(vec!["dt".to_string()]));
    src.insert_rows(rows(json!([{"dt": "20180101", "rating": 5}])));
    // the target already holds every source partition, the diff is empty
    let tgt1 = Arc::new(MemTable::new("tgt1").with_partition_columns(vec!["dt".to_string()]));
    tgt1.insert_rows(rows(json!([{"dt": "20180101", "rating": 5}])));
    let tgt2 = Arc::new(MemTable::new("tgt2").with_partition_columns(vec!["dt".to_string()]));

    let mut registry = InstanceRegistry::new();
    registry.register_data_object(src.clone()).unwrap();
    registry.register_data_object(tgt1.clone()).unwrap();
    registry.register_data_object(tgt2.clone()).unwrap();

    let first = Arc::new(
        Action::new(
            "first",
            vec![DataObjectId::new("src")],
            vec![DataObjectId::new("tgt1")],
            "skip",
        )
        .with_execution_mode(ExecutionMode::PartitionDiff(PartitionDiffMode::default())),
    );
    let second = copy("second", "tgt1", "tgt2", "skip");

    let config = DriverConfig::new("skip-app", "skip");
    let outcome = Driver::new(config, Arc::new(registry), vec![first, second]).run().await;

    assert_eq!(outcome.exit_code, 0);
    let state = outcome.state.unwrap();
    assert_eq!(state.actions_state[&ActionId::new("first")].state, ActionState::Skipped);
    assert_eq!(state.actions_state[&ActionId::new("second")].state, ActionState::Skipped);
    assert!(tgt2.rows().is_empty());
}
