//! Capability contracts between the orchestrator and data object backends.
//!
//! The core never talks to a concrete backend type. A backend implements
//! [`DataObject`] plus whichever capability traits it supports, and exposes
//! them through the accessor methods (`readable()`, `writable()`, ...). The
//! accessors default to `None`, so the kernel can check a required
//! capability and reject a configuration referencing an object that lacks
//! it, without any downcasting.

use crate::error::{DpoError, Result};
use crate::frame::DataFrame;
use crate::id::{ConnectionId, DataObjectId};
use crate::partition::PartitionValues;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a write replaces or extends existing data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Replace the touched partitions, or the whole table when the target
    /// is unpartitioned.
    #[default]
    Overwrite,
    Append,
    /// Upsert by primary key; requires the merge capability.
    Merge,
}

/// Counters reported by a write, merged into the run state per output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteMetrics {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub partitions_written: u64,
}

impl WriteMetrics {
    pub fn inserted(rows: u64, partitions: u64) -> Self {
        Self {
            rows_inserted: rows,
            rows_updated: 0,
            partitions_written: partitions,
        }
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("rows_inserted".to_string(), Value::from(self.rows_inserted));
        map.insert("rows_updated".to_string(), Value::from(self.rows_updated));
        map.insert(
            "partitions_written".to_string(),
            Value::from(self.partitions_written),
        );
        map
    }
}

/// A logical, addressable dataset.
#[async_trait]
pub trait DataObject: Send + Sync {
    fn id(&self) -> DataObjectId;

    fn connection_id(&self) -> Option<ConnectionId> {
        None
    }

    fn partition_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Existence and schema checks, called once during the prepare phase.
    /// No data is read.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn readable(&self) -> Option<&dyn CanRead> {
        None
    }

    fn writable(&self) -> Option<&dyn CanWrite> {
        None
    }

    fn partitioned(&self) -> Option<&dyn CanHandlePartitions> {
        None
    }

    fn mergeable(&self) -> Option<&dyn CanMerge> {
        None
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    fn streamable(&self) -> Option<&dyn CanReadStream> {
        None
    }
}

#[async_trait]
pub trait CanRead: DataObject {
    /// Reads the slice selected by the partition values (empty selects all)
    /// and an optional row filter expression.
    async fn read(
        &self,
        partition_values: &[PartitionValues],
        filter: Option<&str>,
    ) -> Result<DataFrame>;
}

#[async_trait]
pub trait CanWrite: DataObject {
    fn save_mode(&self) -> SaveMode {
        SaveMode::Overwrite
    }

    /// Writes the frame into the partitions named by `partition_values`.
    async fn write(
        &self,
        df: &DataFrame,
        partition_values: &[PartitionValues],
    ) -> Result<WriteMetrics>;
}

#[async_trait]
pub trait CanHandlePartitions: DataObject {
    /// The partition-value records currently offered by the object.
    async fn list_partitions(&self) -> Result<Vec<PartitionValues>>;

    async fn delete_partitions(&self, _partition_values: &[PartitionValues]) -> Result<()> {
        Err(DpoError::config(format!(
            "data object {} does not support deleting partitions",
            self.id()
        )))
    }
}

#[async_trait]
pub trait CanMerge: CanWrite {
    fn primary_key(&self) -> Vec<String>;

    /// Upserts the frame by primary key.
    async fn merge(&self, df: &DataFrame) -> Result<WriteMetrics>;
}

/// Writes wrapped in a transaction; rollback on any error path.
#[async_trait]
pub trait Transactional: DataObject {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

#[async_trait]
pub trait CanReadStream: DataObject {
    /// Reads one micro-batch after the given checkpoint, returning the new
    /// checkpoint to persist. A `None` next checkpoint means the stream is
    /// exhausted at the current position.
    async fn read_increment(
        &self,
        checkpoint: Option<&str>,
    ) -> Result<(DataFrame, Option<String>)>;
}

macro_rules! require_capability {
    ($fn_name:ident, $accessor:ident, $trait_name:ty, $label:literal) => {
        pub fn $fn_name(obj: &Arc<dyn DataObject>) -> Result<&$trait_name> {
            obj.$accessor().ok_or_else(|| {
                DpoError::config(format!("data object {} is not {}", obj.id(), $label))
            })
        }
    };
}

require_capability!(require_readable, readable, dyn CanRead, "readable");
require_capability!(require_writable, writable, dyn CanWrite, "writable");
require_capability!(require_partitioned, partitioned, dyn CanHandlePartitions, "partitioned");
require_capability!(require_mergeable, mergeable, dyn CanMerge, "mergeable");
require_capability!(require_streamable, streamable, dyn CanReadStream, "streamable");
