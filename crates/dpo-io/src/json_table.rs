//! Partitioned newline-delimited JSON file table.
//!
//! Rows live in `part-<uuid>.jsonl` files under hive-style partition
//! directories (`dt=20180101/type=person/`). Partition column values are
//! encoded in the directory path only; they are stripped on write and
//! re-attached on read. An optional filesystem connection scopes every read
//! and write with a pooled session lease.

use anyhow::Context;
use async_trait::async_trait;
use dpo_core::config::JsonTableSpec;
use dpo_core::connection::{Connection, PooledSession};
use dpo_core::dataobject::{
    CanHandlePartitions, CanRead, CanWrite, DataObject, SaveMode, WriteMetrics,
};
use dpo_core::frame::{DataFrame, Record};
use dpo_core::partition::{self, PartitionValues};
use dpo_core::{ConnectionId, DataObjectId, DpoError, Result};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fs_connection::{FsSession, LocalFsConnection};

pub struct JsonFileTable {
    id: DataObjectId,
    dir: PathBuf,
    connection: Option<Arc<LocalFsConnection>>,
    partition_columns: Vec<String>,
    save_mode: SaveMode,
}

impl JsonFileTable {
    pub fn new(id: impl Into<DataObjectId>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            connection: None,
            partition_columns: Vec::new(),
            save_mode: SaveMode::Overwrite,
        }
    }

    pub fn from_spec(spec: &JsonTableSpec, connection: Option<Arc<LocalFsConnection>>) -> Self {
        let dir = match &connection {
            Some(connection) => connection.base_path().join(&spec.path),
            None => PathBuf::from(&spec.path),
        };
        Self {
            id: DataObjectId::new(&spec.id),
            dir,
            connection,
            partition_columns: spec.partition_columns.clone(),
            save_mode: spec.save_mode,
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

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    async fn lease(&self) -> Result<Option<PooledSession<FsSession>>> {
        match &self.connection {
            Some(connection) => Ok(Some(connection.pool().acquire().await?)),
            None => Ok(None),
        }
    }

    /// Partition record encoded in a file path, relative to the table root.
    fn partition_of(&self, file: &Path) -> PartitionValues {
        let mut pv = PartitionValues::new();
        let Ok(relative) = file.strip_prefix(&self.dir) else {
            return pv;
        };
        for component in relative.iter() {
            let Some(text) = component.to_str() else {
                continue;
            };
            if let Some((col, value)) = text.split_once('=') {
                pv = pv.with(col, value);
            }
        }
        pv
    }

    fn partition_dir(&self, pv: &PartitionValues) -> PathBuf {
        let mut dir = self.dir.clone();
        for col in &self.partition_columns {
            if let Some(value) = pv.get(col) {
                dir.push(format!("{}={}", col, value));
            }
        }
        dir
    }

    fn data_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.dir.join("**/*.jsonl");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| DpoError::config(format!("non-utf8 table path for {}", self.id)))?;
        let mut files = Vec::new();
        for entry in
            glob::glob(pattern).map_err(|e| anyhow::anyhow!("invalid glob pattern: {}", e))?
        {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => warn!(table = %self.id, error = %e, "unreadable path skipped"),
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(&self, file: &Path, rows: &mut Vec<Record>) -> Result<()> {
        let partition = self.partition_of(file);
        let handle =
            fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
        for line in BufReader::new(handle).lines() {
            let line = line.with_context(|| format!("reading {}", file.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let mut record: Record = serde_json::from_str(&line)
                .with_context(|| format!("invalid json row in {}", file.display()))?;
            for (col, value) in partition.iter() {
                record.insert(col.to_string(), serde_json::Value::String(value.to_string()));
            }
            rows.push(record);
        }
        Ok(())
    }
}

#[async_trait]
impl DataObject for JsonFileTable {
    fn id(&self) -> DataObjectId {
        self.id.clone()
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| Connection::id(c.as_ref()))
    }

    fn partition_columns(&self) -> Vec<String> {
        self.partition_columns.clone()
    }

    async fn prepare(&self) -> Result<()> {
        if self.dir.exists() && !self.dir.is_dir() {
            return Err(DpoError::precondition(
                &self.id,
                format!("{} exists but is not a directory", self.dir.display()),
            ));
        }
        Ok(())
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
}

#[async_trait]
impl CanRead for JsonFileTable {
    async fn read(
        &self,
        partition_values: &[PartitionValues],
        filter: Option<&str>,
    ) -> Result<DataFrame> {
        let _lease = self.lease().await?;
        let mut rows = Vec::new();
        for file in self.data_files()? {
            if !partition_values.is_empty() {
                let file_partition = self.partition_of(&file);
                let matched = partition_values
                    .iter()
                    .any(|pv| pv.is_included_in(&file_partition));
                if !matched {
                    continue;
                }
            }
            self.read_file(&file, &mut rows)?;
        }
        let df = DataFrame::from_rows(rows);
        debug!(table = %self.id, rows = df.num_rows(), "json table read");
        match filter {
            Some(expr) => df.filter_expr(expr),
            None => Ok(df),
        }
    }
}

#[async_trait]
impl CanWrite for JsonFileTable {
    fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    async fn write(
        &self,
        df: &DataFrame,
        partition_values: &[PartitionValues],
    ) -> Result<WriteMetrics> {
        let _lease = self.lease().await?;

        let mut groups: BTreeMap<PartitionValues, Vec<Record>> = BTreeMap::new();
        for row in &df.rows {
            let mut pv = PartitionValues::new();
            for col in &self.partition_columns {
                let value = row.get(col).ok_or_else(|| {
                    DpoError::config(format!(
                        "row written to {} is missing partition column '{}'",
                        self.id, col
                    ))
                })?;
                pv = pv.with(col.clone(), partition::value_as_string(value));
            }
            let mut stored = row.clone();
            for col in &self.partition_columns {
                stored.remove(col);
            }
            groups.entry(pv).or_default().push(stored);
        }

        if self.save_mode == SaveMode::Overwrite {
            if self.partition_columns.is_empty() {
                for file in self.data_files()? {
                    fs::remove_file(&file)
                        .with_context(|| format!("removing {}", file.display()))?;
                }
            } else {
                let touched: BTreeSet<PartitionValues> = if partition_values.is_empty() {
                    groups.keys().cloned().collect()
                } else {
                    partition_values.iter().cloned().collect()
                };
                for pv in &touched {
                    let dir = self.partition_dir(pv);
                    if dir.exists() {
                        fs::remove_dir_all(&dir)
                            .with_context(|| format!("clearing partition {}", dir.display()))?;
                    }
                }
            }
        }

        let partitions_written = groups.len() as u64;
        for (pv, rows) in groups {
            let dir = self.partition_dir(&pv);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating partition dir {}", dir.display()))?;
            let file = dir.join(format!("part-{}.jsonl", Uuid::new_v4()));
            let mut body = String::new();
            for row in &rows {
                body.push_str(
                    &serde_json::to_string(row)
                        .map_err(|e| anyhow::anyhow!("serializing row: {}", e))?,
                );
                body.push('\n');
            }
            fs::write(&file, body).with_context(|| format!("writing {}", file.display()))?;
        }
        debug!(table = %self.id, rows = df.num_rows(), partitions = partitions_written, "json table written");
        Ok(WriteMetrics::inserted(
            df.num_rows() as u64,
            partitions_written,
        ))
    }
}

#[async_trait]
impl CanHandlePartitions for JsonFileTable {
    async fn list_partitions(&self) -> Result<Vec<PartitionValues>> {
        let mut seen = BTreeSet::new();
        for file in self.data_files()? {
            let pv = self
                .partition_of(&file)
                .project(&self.partition_columns);
            if !pv.is_empty() {
                seen.insert(pv);
            }
        }
        Ok(seen.into_iter().collect())
    }

    async fn delete_partitions(&self, partition_values: &[PartitionValues]) -> Result<()> {
        for pv in partition_values {
            let dir = self.partition_dir(pv);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("deleting partition {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn table(dir: &TempDir) -> JsonFileTable {
        JsonFileTable::new("t", dir.path().join("t"))
            .with_partition_columns(vec!["dt".to_string(), "type".to_string()])
    }

    #[tokio::test]
    async fn write_then_read_reattaches_partition_columns() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let df = DataFrame::from_rows(vec![
            record(json!({"dt": "20180101", "type": "person", "rating": 5})),
            record(json!({"dt": "20190101", "type": "company", "rating": 10})),
        ]);
        table.write(&df, &[]).await.unwrap();

        let all = table.read(&[], None).await.unwrap();
        assert_eq!(all.num_rows(), 2);
        let one = table
            .read(&[PartitionValues::single("dt", "20180101")], None)
            .await
            .unwrap();
        assert_eq!(one.num_rows(), 1);
        assert_eq!(one.rows[0]["type"], "person");
        assert_eq!(one.rows[0]["rating"], 5);
    }

    #[tokio::test]
    async fn lists_partitions_from_directories() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let df = DataFrame::from_rows(vec![
            record(json!({"dt": "20180101", "type": "person", "rating": 5})),
            record(json!({"dt": "20190101", "type": "company", "rating": 10})),
        ]);
        table.write(&df, &[]).await.unwrap();
        let partitions = table.list_partitions().await.unwrap();
        assert_eq!(partitions.len(), 2);
        assert!(partitions.contains(
            &PartitionValues::from_pairs([("dt", "20180101"), ("type", "person")])
        ));
    }

    #[tokio::test]
    async fn overwrite_clears_only_touched_partitions() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        table
            .write(
                &DataFrame::from_rows(vec![
                    record(json!({"dt": "20180101", "type": "person", "rating": 5})),
                    record(json!({"dt": "20190101", "type": "company", "rating": 10})),
                ]),
                &[],
            )
            .await
            .unwrap();

        table
            .write(
                &DataFrame::from_rows(vec![
                    record(json!({"dt": "20180101", "type": "person", "rating": 7})),
                ]),
                &[],
            )
            .await
            .unwrap();

        let all = table.read(&[], None).await.unwrap();
        assert_eq!(all.num_rows(), 2);
        let ratings: Vec<_> = all.column_values("rating");
        assert!(ratings.contains(&json!(7)));
        assert!(ratings.contains(&json!(10)));
    }
}
