//! In-memory partitioned table.
//!
//! Backs tests and staging pipelines: rows live in a shared vector, the
//! partition list is derived from the data, and writes support the three
//! save modes including primary-key merge. Writes are transactional through
//! a snapshot taken in `begin` and restored on rollback.

use async_trait::async_trait;
use dpo_core::config::MemTableSpec;
use dpo_core::dataobject::{
    CanHandlePartitions, CanMerge, CanRead, CanWrite, DataObject, SaveMode, Transactional,
    WriteMetrics,
};
use dpo_core::frame::{DataFrame, Record};
use dpo_core::partition::{self, PartitionValues};
use dpo_core::{DataObjectId, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Default)]
struct MemTableState {
    rows: Vec<Record>,
    snapshot: Option<Vec<Record>>,
}

pub struct MemTable {
    id: DataObjectId,
    partition_columns: Vec<String>,
    save_mode: SaveMode,
    primary_key: Vec<String>,
    state: Arc<RwLock<MemTableState>>,
}

impl MemTable {
    pub fn new(id: impl Into<DataObjectId>) -> Self {
        Self {
            id: id.into(),
            partition_columns: Vec::new(),
            save_mode: SaveMode::Overwrite,
            primary_key: Vec::new(),
            state: Arc::new(RwLock::new(MemTableState::default())),
        }
    }

    pub fn from_spec(spec: &MemTableSpec) -> Self {
        Self {
            id: DataObjectId::new(&spec.id),
            partition_columns: spec.partition_columns.clone(),
            save_mode: spec.save_mode,
            primary_key: spec.primary_key.clone(),
            state: Arc::new(RwLock::new(MemTableState::default())),
        }
    }

    pub fn with_partition_columns(mut self, columns: Vec<String>) -> Self {
        self.partition_columns = columns;
        self
    }

    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    pub fn with_primary_key(mut self, primary_key: Vec<String>) -> Self {
        self.primary_key = primary_key;
        self
    }

    /// Seeds rows directly, bypassing save-mode handling.
    pub fn insert_rows(&self, rows: Vec<Record>) {
        self.state.write().expect("table lock").rows.extend(rows);
    }

    pub fn rows(&self) -> Vec<Record> {
        self.state.read().expect("table lock").rows.clone()
    }

    pub fn clear(&self) {
        self.state.write().expect("table lock").rows.clear();
    }

    fn key_of(&self, record: &Record) -> Vec<String> {
        self.primary_key
            .iter()
            .map(|col| {
                record
                    .get(col)
                    .map(partition::value_as_string)
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[async_trait]
impl DataObject for MemTable {
    fn id(&self) -> DataObjectId {
        self.id.clone()
    }

    fn partition_columns(&self) -> Vec<String> {
        self.partition_columns.clone()
    }

    fn readable(&self) -> Option<&dyn CanRead> {
        Some(self)
    }

    fn writable(&self) -> Option<&dyn CanWrite> {
        Some(self)
    }

    fn partitioned(&self) -> Option<&dyn CanHandlePartitions> {
        if self.partition_columns.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    fn mergeable(&self) -> Option<&dyn CanMerge> {
        if self.primary_key.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

#[async_trait]
impl CanRead for MemTable {
    async fn read(
        &self,
        partition_values: &[PartitionValues],
        filter: Option<&str>,
    ) -> Result<DataFrame> {
        let rows = self.rows();
        let df = DataFrame::from_rows(rows).filter_partitions(partition_values);
        match filter {
            Some(expr) => df.filter_expr(expr),
            None => Ok(df),
        }
    }
}

#[async_trait]
impl CanWrite for MemTable {
    fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    async fn write(
        &self,
        df: &DataFrame,
        partition_values: &[PartitionValues],
    ) -> Result<WriteMetrics> {
        if self.save_mode == SaveMode::Merge {
            return self.merge(df).await;
        }
        let mut state = self.state.write().expect("table lock");
        if self.save_mode == SaveMode::Overwrite {
            if partition_values.is_empty() {
                state.rows.clear();
            } else {
                state
                    .rows
                    .retain(|row| !partition_values.iter().any(|pv| pv.matches_record(row)));
            }
        }
        state.rows.extend(df.rows.iter().cloned());
        debug!(table = %self.id, rows = df.num_rows(), "memory table written");
        Ok(WriteMetrics::inserted(
            df.num_rows() as u64,
            partition_values.len().max(1) as u64,
        ))
    }
}

#[async_trait]
impl CanHandlePartitions for MemTable {
    async fn list_partitions(&self) -> Result<Vec<PartitionValues>> {
        let rows = self.rows();
        let mut seen = BTreeSet::new();
        for row in &rows {
            let mut pv = PartitionValues::new();
            for col in &self.partition_columns {
                if let Some(value) = row.get(col) {
                    pv = pv.with(col.clone(), partition::value_as_string(value));
                }
            }
            if !pv.is_empty() {
                seen.insert(pv);
            }
        }
        Ok(seen.into_iter().collect())
    }

    async fn delete_partitions(&self, partition_values: &[PartitionValues]) -> Result<()> {
        let mut state = self.state.write().expect("table lock");
        state
            .rows
            .retain(|row| !partition_values.iter().any(|pv| pv.matches_record(row)));
        Ok(())
    }
}

#[async_trait]
impl CanMerge for MemTable {
    fn primary_key(&self) -> Vec<String> {
        self.primary_key.clone()
    }

    async fn merge(&self, df: &DataFrame) -> Result<WriteMetrics> {
        let mut state = self.state.write().expect("table lock");
        let mut inserted = 0;
        let mut updated = 0;
        for row in &df.rows {
            let key = self.key_of(row);
            let position = state.rows.iter().position(|existing| {
                self.primary_key.iter().zip(&key).all(|(col, value)| {
                    existing
                        .get(col)
                        .map(partition::value_as_string)
                        .unwrap_or_default()
                        == *value
                })
            });
            match position {
                Some(index) => {
                    state.rows[index] = row.clone();
                    updated += 1;
                }
                None => {
                    state.rows.push(row.clone());
                    inserted += 1;
                }
            }
        }
        debug!(table = %self.id, inserted, updated, "memory table merged");
        Ok(WriteMetrics {
            rows_inserted: inserted,
            rows_updated: updated,
            partitions_written: 1,
        })
    }
}

#[async_trait]
impl Transactional for MemTable {
    async fn begin(&self) -> Result<()> {
        let mut state = self.state.write().expect("table lock");
        state.snapshot = Some(state.rows.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state.write().expect("table lock").snapshot = None;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.write().expect("table lock");
        if let Some(snapshot) = state.snapshot.take() {
            state.rows = snapshot;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn partitioned_table() -> MemTable {
        let table = MemTable::new("t").with_partition_columns(vec!["dt".to_string()]);
        table.insert_rows(vec![
            record(json!({"dt": "20180101", "rating": 5})),
            record(json!({"dt": "20190101", "rating": 10})),
        ]);
        table
    }

    #[tokio::test]
    async fn read_filters_by_partition_values() {
        let table = partitioned_table();
        let df = table
            .read(&[PartitionValues::single("dt", "20180101")], None)
            .await
            .unwrap();
        assert_eq!(df.num_rows(), 1);
        assert_eq!(df.rows[0]["rating"], 5);
    }

    #[tokio::test]
    async fn overwrite_replaces_only_the_touched_partitions() {
        let table = partitioned_table();
        let incoming = DataFrame::from_rows(vec![record(json!({"dt": "20180101", "rating": 7}))]);
        table
            .write(&incoming, &[PartitionValues::single("dt", "20180101")])
            .await
            .unwrap();
        let rows = table.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r["rating"] == 7));
        assert!(rows.iter().any(|r| r["rating"] == 10));
    }

    #[tokio::test]
    async fn merge_upserts_by_primary_key() {
        let table = MemTable::new("t")
            .with_save_mode(SaveMode::Merge)
            .with_primary_key(vec!["type".to_string(), "lastname".to_string(), "firstname".to_string()]);
        let first = DataFrame::from_rows(vec![
            record(json!({"type": "ext", "lastname": "doe", "firstname": "john", "rating": 5})),
            record(json!({"type": "ext", "lastname": "smith", "firstname": "peter", "rating": 3})),
        ]);
        table.write(&first, &[]).await.unwrap();
        let second = DataFrame::from_rows(vec![
            record(json!({"type": "ext", "lastname": "doe", "firstname": "john", "rating": 10})),
            record(json!({"type": "int", "lastname": "emma", "firstname": "brown", "rating": 7})),
        ]);
        let metrics = table.write(&second, &[]).await.unwrap();
        assert_eq!(metrics.rows_updated, 1);
        assert_eq!(metrics.rows_inserted, 1);
        let rows = table.rows();
        assert_eq!(rows.len(), 3);
        let doe = rows
            .iter()
            .find(|r| r["lastname"] == "doe")
            .unwrap();
        assert_eq!(doe["rating"], 10);
    }

    #[tokio::test]
    async fn rollback_restores_the_snapshot() {
        let table = partitioned_table();
        table.begin().await.unwrap();
        table
            .write(&DataFrame::from_rows(vec![record(json!({"dt": "x"}))]), &[])
            .await
            .unwrap();
        table.rollback().await.unwrap();
        assert_eq!(table.rows().len(), 2);
    }

    #[tokio::test]
    async fn lists_distinct_partitions() {
        let table = partitioned_table();
        let partitions = table.list_partitions().await.unwrap();
        assert_eq!(
            partitions,
            vec![
                PartitionValues::single("dt", "20180101"),
                PartitionValues::single("dt", "20190101"),
            ]
        );
    }
}
