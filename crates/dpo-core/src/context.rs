//! Per-run context threaded through the scheduler.
//!
//! Everything an action needs beyond its own configuration lives here: run
//! and attempt identity, the partition values given on the command line, the
//! instance registry, cached execution-mode results and the metrics
//! collector. Mode results are attempt-scoped state kept out of the action
//! instances on purpose: actions stay immutable between runs.

use crate::execmode::ModeResult;
use crate::id::ActionId;
use crate::metrics::MetricsCollector;
use crate::partition::PartitionValues;
use crate::registry::InstanceRegistry;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Prepare,
    Init,
    Exec,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::Prepare => "prepare",
            ExecutionPhase::Init => "init",
            ExecutionPhase::Exec => "exec",
        };
        f.write_str(name)
    }
}

pub struct RunContext {
    pub app_name: String,
    pub run_id: u32,
    pub attempt_id: u32,
    pub run_start_time: DateTime<Utc>,
    pub attempt_start_time: DateTime<Utc>,
    /// Partition values given on the command line, applied to DAG-start
    /// subfeeds and the fixed-partition-values mode.
    pub app_partition_values: Vec<PartitionValues>,
    pub registry: Arc<InstanceRegistry>,
    /// Mode results selected during init, reused during exec.
    mode_results: Mutex<HashMap<ActionId, ModeResult>>,
    /// Mode results replayed verbatim from the previous attempt.
    pub replayed_mode_results: HashMap<ActionId, ModeResult>,
    /// Actions whose mode decided during init that there is nothing to
    /// process; exec short-circuits them to skipped outputs.
    skipped_actions: Mutex<HashSet<ActionId>>,
    pub metrics: MetricsCollector,
}

impl RunContext {
    pub fn new(
        app_name: impl Into<String>,
        run_id: u32,
        attempt_id: u32,
        run_start_time: DateTime<Utc>,
        app_partition_values: Vec<PartitionValues>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            run_id,
            attempt_id,
            run_start_time,
            attempt_start_time: Utc::now(),
            app_partition_values,
            registry,
            mode_results: Mutex::new(HashMap::new()),
            replayed_mode_results: HashMap::new(),
            skipped_actions: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn mark_skipped(&self, action_id: &ActionId) {
        self.skipped_actions
            .lock()
            .expect("skip cache poisoned")
            .insert(action_id.clone());
    }

    pub fn is_marked_skipped(&self, action_id: &ActionId) -> bool {
        self.skipped_actions
            .lock()
            .expect("skip cache poisoned")
            .contains(action_id)
    }

    pub fn with_replayed_mode_results(
        mut self,
        replayed: HashMap<ActionId, ModeResult>,
    ) -> Self {
        self.replayed_mode_results = replayed;
        self
    }

    /// The result cached for this attempt, replayed results taking
    /// precedence so a recovery processes exactly what the prior attempt
    /// selected.
    pub fn cached_mode_result(&self, action_id: &ActionId) -> Option<ModeResult> {
        if let Some(replayed) = self.replayed_mode_results.get(action_id) {
            return Some(replayed.clone());
        }
        self.mode_results
            .lock()
            .expect("mode results poisoned")
            .get(action_id)
            .cloned()
    }

    pub fn cache_mode_result(&self, action_id: &ActionId, result: ModeResult) {
        self.mode_results
            .lock()
            .expect("mode results poisoned")
            .insert(action_id.clone(), result);
    }

    pub fn mode_results_snapshot(&self) -> HashMap<ActionId, ModeResult> {
        let mut snapshot = self
            .mode_results
            .lock()
            .expect("mode results poisoned")
            .clone();
        for (id, result) in &self.replayed_mode_results {
            snapshot.entry(id.clone()).or_insert_with(|| result.clone());
        }
        snapshot
    }

    /// Base expression context document shared by every condition of a run.
    pub fn base_expression_doc(&self, feed: &str) -> Value {
        json!({
            "application": self.app_name,
            "run_id": self.run_id,
            "attempt_id": self.attempt_id,
            "feed": feed,
            "run_start_time": self.run_start_time.to_rfc3339(),
        })
    }
}
