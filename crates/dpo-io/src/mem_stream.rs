//! In-memory micro-batch stream source.
//!
//! Batches are appended by a producer and consumed one per micro-batch
//! through the streaming capability; the checkpoint is the offset of the
//! next unread batch. Reading the object as a plain table replays every
//! batch, which lets non-streaming actions share the same source.

use async_trait::async_trait;
use dpo_core::dataobject::{CanRead, CanReadStream, DataObject};
use dpo_core::frame::DataFrame;
use dpo_core::partition::PartitionValues;
use dpo_core::{DataObjectId, DpoError, Result};
use std::sync::{Arc, RwLock};
use tracing::debug;

pub struct MemStream {
    id: DataObjectId,
    batches: Arc<RwLock<Vec<DataFrame>>>,
}

impl MemStream {
    pub fn new(id: impl Into<DataObjectId>) -> Self {
        Self {
            id: id.into(),
            batches: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn push_batch(&self, batch: DataFrame) {
        self.batches.write().expect("stream lock").push(batch);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().expect("stream lock").len()
    }
}

#[async_trait]
impl DataObject for MemStream {
    fn id(&self) -> DataObjectId {
        self.id.clone()
    }

    fn readable(&self) -> Option<&dyn CanRead> {
        Some(self)
    }

    fn streamable(&self) -> Option<&dyn CanReadStream> {
        Some(self)
    }
}

#[async_trait]
impl CanRead for MemStream {
    async fn read(
        &self,
        _partition_values: &[PartitionValues],
        filter: Option<&str>,
    ) -> Result<DataFrame> {
        let batches = self.batches.read().expect("stream lock").clone();
        let df = batches
            .into_iter()
            .fold(DataFrame::empty(), |acc, batch| acc.union(batch));
        match filter {
            Some(expr) => df.filter_expr(expr),
            None => Ok(df),
        }
    }
}

#[async_trait]
impl CanReadStream for MemStream {
    async fn read_increment(
        &self,
        checkpoint: Option<&str>,
    ) -> Result<(DataFrame, Option<String>)> {
        let offset: usize = match checkpoint {
            Some(text) => text.parse().map_err(|_| {
                DpoError::config(format!("invalid checkpoint '{}' for stream {}", text, self.id))
            })?,
            None => 0,
        };
        let batches = self.batches.read().expect("stream lock");
        if offset < batches.len() {
            let batch = batches[offset].clone();
            debug!(stream = %self.id, offset, rows = batch.num_rows(), "micro-batch read");
            Ok((batch, Some((offset + 1).to_string())))
        } else {
            Ok((DataFrame::empty(), None))
        }
    }
}
