//! Streaming-once checkpoints and incremental high-water-mark loading
//! across consecutive runs.

mod common;

use common::rows;
use dpo_core::dataobject::SaveMode;
use dpo_core::execmode::ExecutionMode;
use dpo_core::frame::DataFrame;
use dpo_core::{Action, DataObjectId, Driver, DriverConfig, InstanceRegistry};
use dpo_io::{MemStream, MemTable};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn streaming_once_advances_the_checkpoint_per_run() {
    let stream = Arc::new(MemStream::new("events"));
    stream.push_batch(DataFrame::from_rows(rows(json!([{"seq": 1}]))));
    stream.push_batch(DataFrame::from_rows(rows(json!([{"seq": 2}]))));
    let tgt = Arc::new(MemTable::new("tgt").with_save_mode(SaveMode::Append));

    let mut registry = InstanceRegistry::new();
    registry.register_data_object(stream.clone()).unwrap();
    registry.register_data_object(tgt.clone()).unwrap();
    let registry = Arc::new(registry);

    let checkpoint_dir = TempDir::new().unwrap();
    let checkpoint = checkpoint_dir
        .path()
        .join("events.ckpt")
        .to_str()
        .unwrap()
        .to_string();
    let action = || {
        Arc::new(
            Action::new(
                "ingest",
                vec![DataObjectId::new("events")],
                vec![DataObjectId::new("tgt")],
                "stream",
            )
            .with_execution_mode(ExecutionMode::StreamingOnce {
                checkpoint_location: checkpoint.clone(),
            }),
        )
    };

    let outcome = Driver::new(
        DriverConfig::new("stream-app", "stream"),
        registry.clone(),
        vec![action()],
    )
    .run()
    .await;
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(tgt.rows().len(), 1);
    assert_eq!(tgt.rows()[0]["seq"], 1);
    assert_eq!(std::fs::read_to_string(&checkpoint).unwrap(), "1");

    let outcome = Driver::new(
        DriverConfig::new("stream-app", "stream"),
        registry.clone(),
        vec![action()],
    )
    .run()
    .await;
    assert_eq!(outcome.exit_code, 0);
    let mut seqs: Vec<i64> = tgt
        .rows()
        .iter()
        .map(|row| row["seq"].as_i64().unwrap())
        .collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(std::fs::read_to_string(&checkpoint).unwrap(), "2");
}

#[tokio::test]
async fn incremental_mode_loads_only_rows_past_the_high_water_mark() {
    let src = Arc::new(MemTable::new("src"));
    src.insert_rows(rows(json!([
        {"seq": 1, "payload": "a"},
        {"seq": 2, "payload": "b"}
    ])));
    let tgt = Arc::new(MemTable::new("tgt").with_save_mode(SaveMode::Append));

    let mut registry = InstanceRegistry::new();
    registry.register_data_object(src.clone()).unwrap();
    registry.register_data_object(tgt.clone()).unwrap();
    let registry = Arc::new(registry);

    let action = || {
        Arc::new(
            Action::new(
                "load",
                vec![DataObjectId::new("src")],
                vec![DataObjectId::new("tgt")],
                "incr",
            )
            .with_execution_mode(ExecutionMode::Incremental {
                compare_col: "seq".to_string(),
            }),
        )
    };

    let outcome = Driver::new(
        DriverConfig::new("incr-app", "incr"),
        registry.clone(),
        vec![action()],
    )
    .run()
    .await;
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(tgt.rows().len(), 2);

    // two new rows and one stale duplicate
    src.insert_rows(rows(json!([
        {"seq": 2, "payload": "stale"},
        {"seq": 3, "payload": "c"},
        {"seq": 4, "payload": "d"}
    ])));

    let outcome = Driver::new(
        DriverConfig::new("incr-app", "incr"),
        registry.clone(),
        vec![action()],
    )
    .run()
    .await;
    assert_eq!(outcome.exit_code, 0);
    let mut seqs: Vec<i64> = tgt
        .rows()
        .iter()
        .map(|row| row["seq"].as_i64().unwrap())
        .collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}
