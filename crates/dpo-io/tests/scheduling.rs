//! Scheduler ordering and failure propagation through the driver.

mod common;

use common::{failing_transformer, rows};
use dpo_core::state::ActionState;
use dpo_core::{Action, ActionId, DataObjectId, Driver, DriverConfig, InstanceRegistry};
use dpo_io::MemTable;
use serde_json::json;
use std::sync::Arc;

fn copy(id: &str, input: &str, output: &str) -> Arc<Action> {
    Arc::new(Action::new(
        id,
        vec![DataObjectId::new(input)],
        vec![DataObjectId::new(output)],
        "sched",
    ))
}

fn registry_with_tables(ids: &[&str]) -> (Arc<InstanceRegistry>, Vec<Arc<MemTable>>) {
    let mut registry = InstanceRegistry::new();
    let mut tables = Vec::new();
    for id in ids {
        let table = Arc::new(MemTable::new(*id));
        registry.register_data_object(table.clone()).unwrap();
        tables.push(table);
    }
    (Arc::new(registry), tables)
}

#[tokio::test]
async fn dependent_actions_run_in_topological_order_even_with_parallelism() {
    let (registry, tables) = registry_with_tables(&["src", "m1", "m2", "out"]);
    tables[0].insert_rows(rows(json!([{"rating": 5}])));

    let actions = vec![
        copy("c", "m2", "out"),
        copy("a", "src", "m1"),
        copy("b", "m1", "m2"),
    ];
    let mut config = DriverConfig::new("order-app", "sched");
    config.parallelism = 4;
    let outcome = Driver::new(config, registry, actions).run().await;
    assert_eq!(outcome.exit_code, 0);

    let state = outcome.state.unwrap();
    let a = &state.actions_state[&ActionId::new("a")];
    let b = &state.actions_state[&ActionId::new("b")];
    let c = &state.actions_state[&ActionId::new("c")];
    assert!(a.end_time.unwrap() <= b.start_time.unwrap());
    assert!(b.end_time.unwrap() <= c.start_time.unwrap());
    assert_eq!(tables[3].rows().len(), 1);
}

#[tokio::test]
async fn a_failure_cancels_descendants_and_spares_siblings_when_continuing() {
    let (registry, tables) = registry_with_tables(&["src", "bad", "worse", "good"]);
    tables[0].insert_rows(rows(json!([{"rating": 5}])));

    let failing = Arc::new(
        Action::new(
            "failing",
            vec![DataObjectId::new("src")],
            vec![DataObjectId::new("bad")],
            "sched",
        )
        .with_transformer(failing_transformer()),
    );
    let actions = vec![
        failing,
        copy("downstream", "bad", "worse"),
        copy("sibling", "src", "good"),
    ];

    let mut config = DriverConfig::new("cancel-app", "sched");
    config.continue_on_failure = true;
    let outcome = Driver::new(config, registry, actions).run().await;
    assert_eq!(outcome.exit_code, 2);

    let state = outcome.state.unwrap();
    assert_eq!(state.actions_state[&ActionId::new("failing")].state, ActionState::Failed);
    assert_eq!(
        state.actions_state[&ActionId::new("downstream")].state,
        ActionState::Cancelled
    );
    assert_eq!(state.actions_state[&ActionId::new("sibling")].state, ActionState::Succeeded);
    assert_eq!(tables[3].rows().len(), 1);
}

#[tokio::test]
async fn fail_fast_cancels_everything_not_yet_started() {
    let (registry, tables) = registry_with_tables(&["src", "bad", "worse"]);
    tables[0].insert_rows(rows(json!([{"rating": 5}])));

    let failing = Arc::new(
        Action::new(
            "failing",
            vec![DataObjectId::new("src")],
            vec![DataObjectId::new("bad")],
            "sched",
        )
        .with_transformer(failing_transformer()),
    );
    let actions = vec![failing, copy("downstream", "bad", "worse")];

    let outcome = Driver::new(DriverConfig::new("failfast-app", "sched"), registry, actions)
        .run()
        .await;
    assert_eq!(outcome.exit_code, 2);
    let state = outcome.state.unwrap();
    assert_eq!(
        state.actions_state[&ActionId::new("downstream")].state,
        ActionState::Cancelled
    );
}
