//! End-to-end run from a YAML configuration: file tables behind a pooled
//! filesystem connection, a row filter with option substitution, and a
//! partition filter from the driver.

mod common;

use common::rows;
use dpo_core::dataobject::{CanRead, CanWrite};
use dpo_core::frame::DataFrame;
use dpo_core::{Driver, DriverConfig, InstanceRegistry, PartitionValues, PipelineConfig};
use dpo_io::{build_instances, JsonFileTable};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn yaml_defined_pipeline_copies_filtered_partitions() {
    let base = TempDir::new().unwrap();
    let seed = JsonFileTable::new("seed", base.path().join("src"))
        .with_partition_columns(vec!["dt".to_string()]);
    seed.write(
        &DataFrame::from_rows(rows(json!([
            {"dt": "20180101", "rating": 5},
            {"dt": "20180101", "rating": 1},
            {"dt": "20190101", "rating": 10}
        ]))),
        &[],
    )
    .await
    .unwrap();

    let yaml = format!(
        r#"
connections:
  - type: local_fs
    id: lake
    base_path: "{}"
data_objects:
  - type: json_table
    id: src
    path: src
    connection_id: lake
    partition_columns: [dt]
  - type: json_table
    id: tgt
    path: tgt
    connection_id: lake
    partition_columns: [dt]
actions:
  - id: copy
    feed: ingest
    inputs: [src]
    outputs: [tgt]
    transformers:
      - type: filter_rows
        condition: "rating > %{{min_rating}}"
    options:
      min_rating: "3"
"#,
        base.path().display()
    );
    let config = PipelineConfig::from_yaml(&yaml).unwrap();
    let instances = build_instances(&config, InstanceRegistry::new()).unwrap();

    let driver_config = DriverConfig::new("yaml-app", "ingest")
        .with_partition_values(vec![PartitionValues::single("dt", "20180101")]);
    let outcome = Driver::new(driver_config, instances.registry, instances.actions)
        .run()
        .await;
    assert_eq!(outcome.exit_code, 0);

    let check = JsonFileTable::new("check", base.path().join("tgt"))
        .with_partition_columns(vec!["dt".to_string()]);
    let written = check.read(&[], None).await.unwrap();
    // the low-rating row is filtered out, the 2019 partition never read
    assert_eq!(written.num_rows(), 1);
    assert_eq!(written.rows[0]["rating"], 5);
    assert_eq!(written.rows[0]["dt"], "20180101");
}

#[tokio::test]
async fn config_test_mode_validates_without_writing() {
    let base = TempDir::new().unwrap();
    let yaml = format!(
        r#"
connections:
  - type: local_fs
    id: lake
    base_path: "{}"
data_objects:
  - type: json_table
    id: src
    path: src
    connection_id: lake
  - type: json_table
    id: tgt
    path: tgt
    connection_id: lake
actions:
  - id: copy
    feed: ingest
    inputs: [src]
    outputs: [tgt]
"#,
        base.path().display()
    );
    let config = PipelineConfig::from_yaml(&yaml).unwrap();
    let instances = build_instances(&config, InstanceRegistry::new()).unwrap();

    let mut driver_config = DriverConfig::new("yaml-test-app", "ingest");
    driver_config.test_mode = Some(dpo_core::TestMode::Config);
    let outcome = Driver::new(driver_config, instances.registry, instances.actions)
        .run()
        .await;
    assert_eq!(outcome.exit_code, 0);
    assert!(!base.path().join("tgt").exists());
}
