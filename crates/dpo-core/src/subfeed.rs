//! The typed message flowing along a DAG edge.
//!
//! A [`SubFeed`] describes the slice of one data object an action processes:
//! the partition values selected, an optional row filter, lineage and skip
//! flags, and optionally a payload frame produced by the upstream action.
//! Recipients treat subfeeds as immutable; every transformation returns a
//! new instance. The payload never crosses a process boundary: it is skipped
//! on serialization, so subfeeds recovered from a state file force the
//! downstream action to re-materialize from the data object.

use crate::execmode::ModeResult;
use crate::frame::DataFrame;
use crate::id::DataObjectId;
use crate::partition::{self, PartitionValues};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubFeed {
    pub data_object_id: DataObjectId,
    #[serde(default)]
    pub partition_values: Vec<PartitionValues>,
    #[serde(default)]
    pub is_dag_start: bool,
    #[serde(default)]
    pub is_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip)]
    pub payload: Option<DataFrame>,
}

impl SubFeed {
    pub fn new(data_object_id: DataObjectId) -> Self {
        Self {
            data_object_id,
            partition_values: Vec::new(),
            is_dag_start: false,
            is_skipped: false,
            filter: None,
            payload: None,
        }
    }

    pub fn with_partition_values(mut self, partition_values: Vec<PartitionValues>) -> Self {
        self.partition_values = partition_values;
        self
    }

    pub fn dag_start(mut self) -> Self {
        self.is_dag_start = true;
        self
    }

    /// Projects the partition values onto the given partition columns.
    /// Extra keys are silently dropped; records that end up empty contribute
    /// no filter and are removed.
    pub fn project(&self, partition_columns: &[String]) -> SubFeed {
        let mut projected = self.clone();
        projected.partition_values =
            partition::project_all(&self.partition_values, partition_columns);
        projected
    }

    /// Drops the payload so the downstream action re-materializes from the
    /// data object instead of chaining the upstream plan.
    pub fn break_lineage(mut self) -> SubFeed {
        self.payload = None;
        self
    }

    /// Replaces partition values and filter with the selection an execution
    /// mode computed. The mode may have changed the data set between
    /// planning and execution, so lineage is always broken.
    pub fn apply_mode_result(&self, result: &ModeResult) -> SubFeed {
        let mut updated = self.clone();
        updated.partition_values = result.partition_values.clone();
        updated.filter = result.filter.clone();
        updated.break_lineage()
    }

    /// Marks the subfeed skipped, clearing selection, filter and payload.
    pub fn into_skipped(mut self) -> SubFeed {
        self.is_skipped = true;
        self.partition_values = Vec::new();
        self.filter = None;
        self.payload = None;
        self
    }

    /// Clears the skip flag, used when an execution condition forces an
    /// action to run on otherwise skipped inputs.
    pub fn reset_skipped(mut self) -> SubFeed {
        self.is_skipped = false;
        self.filter = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv(pairs: &[(&str, &str)]) -> PartitionValues {
        PartitionValues::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn project_keeps_only_target_partition_columns() {
        let sf = SubFeed::new("src".into()).with_partition_values(vec![
            pv(&[("dt", "1"), ("type", "a")]),
            pv(&[("dt", "1"), ("type", "b")]),
        ]);
        let projected = sf.project(&["dt".to_string()]);
        assert_eq!(projected.partition_values, vec![pv(&[("dt", "1")])]);
    }

    #[test]
    fn projecting_onto_foreign_columns_clears_the_selection() {
        let sf = SubFeed::new("src".into())
            .with_partition_values(vec![pv(&[("other", "x")])]);
        let projected = sf.project(&["dt".to_string()]);
        assert!(projected.partition_values.is_empty());
    }

    #[test]
    fn skipped_subfeeds_carry_no_selection() {
        let sf = SubFeed::new("src".into())
            .with_partition_values(vec![pv(&[("dt", "1")])]);
        let mut sf = sf;
        sf.filter = Some("rating > 1".to_string());
        let skipped = sf.into_skipped();
        assert!(skipped.is_skipped);
        assert!(skipped.partition_values.is_empty());
        assert!(skipped.filter.is_none());
    }

    #[test]
    fn payload_does_not_survive_serialization() {
        let mut sf = SubFeed::new("src".into());
        sf.payload = Some(DataFrame::empty());
        let json = serde_json::to_string(&sf).unwrap();
        let back: SubFeed = serde_json::from_str(&json).unwrap();
        assert!(back.payload.is_none());
    }
}
