//! Durable run state and the on-disk state store.
//!
//! One append-only JSON record per run attempt, written atomically under
//! `<root>/<app_name>/`. A record is self-describing: schema version, run
//! and attempt ids, a configuration digest and the per-action results.
//! Unknown fields survive a round-trip, so newer writers can extend the
//! format without breaking older readers.
//!
//! Recovery replays the latest record: succeeded actions contribute their
//! recorded output subfeeds, everything else re-executes with the mode
//! results the prior attempt selected.

use crate::error::{DpoError, Result};
use crate::execmode::ModeResult;
use crate::id::ActionId;
use crate::subfeed::SubFeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Pending,
    Skipped,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_final_success(self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::Skipped)
    }
}

/// Outcome of one action in one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRunInfo {
    pub state: ActionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SubFeed>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_result: Option<ModeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ActionRunInfo {
    pub fn pending() -> Self {
        Self {
            state: ActionState::Pending,
            start_time: None,
            end_time: None,
            results: Vec::new(),
            metrics: BTreeMap::new(),
            mode_result: None,
            failure_kind: None,
            message: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Durable record of a single end-to-end run attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub app_name: String,
    pub run_id: u32,
    pub attempt_id: u32,
    pub run_start_time: DateTime<Utc>,
    pub attempt_start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    #[serde(default)]
    pub actions_state: BTreeMap<ActionId, ActionRunInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RunState {
    pub fn new(
        app_name: impl Into<String>,
        run_id: u32,
        attempt_id: u32,
        run_start_time: DateTime<Utc>,
        attempt_start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            app_name: app_name.into(),
            run_id,
            attempt_id,
            run_start_time,
            attempt_start_time,
            end_time: None,
            config_digest: None,
            actions_state: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// True when every action ended in a success state.
    pub fn is_succeeded(&self) -> bool {
        !self.actions_state.is_empty()
            && self
                .actions_state
                .values()
                .all(|info| info.state.is_final_success())
    }

    pub fn has_failures(&self) -> bool {
        self.actions_state.values().any(|info| {
            matches!(
                info.state,
                ActionState::Failed | ActionState::Cancelled | ActionState::Pending
            )
        })
    }
}

/// Pointer to one state file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFileRef {
    pub path: PathBuf,
    pub run_id: u32,
    pub attempt_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep at most this many state files.
    #[serde(default)]
    pub max_files: Option<usize>,
    /// Delete state files older than this many days.
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

pub struct StateStore {
    dir: PathBuf,
    retention: RetentionConfig,
}

impl StateStore {
    pub fn new(root: &Path, app_name: &str, retention: RetentionConfig) -> Result<Self> {
        let dir = root.join(app_name);
        fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("creating state dir {}: {}", dir.display(), e))?;
        Ok(Self { dir, retention })
    }

    /// Atomically writes the attempt record. Existing attempts are never
    /// modified; saving the same attempt twice replaces its file.
    pub fn save(&self, state: &RunState) -> Result<PathBuf> {
        let name = format!(
            "{:04}_{:02}_{}.json",
            state.run_id,
            state.attempt_id,
            state.attempt_start_time.format("%Y%m%d%H%M%S")
        );
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| anyhow::anyhow!("serializing run state: {}", e))?;
        fs::write(&tmp, body)
            .map_err(|e| anyhow::anyhow!("writing {}: {}", tmp.display(), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| anyhow::anyhow!("renaming state file into place: {}", e))?;
        debug!(path = %path.display(), "saved run state");
        Ok(path)
    }

    /// State files ordered newest first by (run id, attempt id).
    pub fn list_states(&self) -> Result<Vec<StateFileRef>> {
        let mut refs = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| anyhow::anyhow!("reading state dir {}: {}", self.dir.display(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| anyhow::anyhow!("reading state dir entry: {}", e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            match parse_state_file_name(name) {
                Some((run_id, attempt_id)) => refs.push(StateFileRef {
                    path,
                    run_id,
                    attempt_id,
                }),
                None => warn!(file = name, "ignoring unrecognized file in state dir"),
            }
        }
        refs.sort_by(|a, b| (b.run_id, b.attempt_id).cmp(&(a.run_id, a.attempt_id)));
        Ok(refs)
    }

    pub fn get_latest_state(&self) -> Result<Option<StateFileRef>> {
        Ok(self.list_states()?.into_iter().next())
    }

    pub fn recover_run_state(path: &Path) -> Result<RunState> {
        let body = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading state file {}: {}", path.display(), e))?;
        let state: RunState = serde_json::from_str(&body).map_err(|e| {
            DpoError::config(format!("invalid state file {}: {}", path.display(), e))
        })?;
        Ok(state)
    }

    /// Applies the retention policy. The newest file is never deleted.
    pub fn cleanup(&self) -> Result<usize> {
        let refs = self.list_states()?;
        if refs.len() <= 1 {
            return Ok(0);
        }
        let mut deleted = 0;
        for (index, state_ref) in refs.iter().enumerate() {
            if index == 0 {
                continue;
            }
            let by_count = self
                .retention
                .max_files
                .map(|max| index >= max.max(1))
                .unwrap_or(false);
            let by_age = match self.retention.max_age_days {
                Some(days) => file_age_days(&state_ref.path).map(|age| age > days as i64).unwrap_or(false),
                None => false,
            };
            if by_count || by_age {
                if let Err(e) = fs::remove_file(&state_ref.path) {
                    warn!(path = %state_ref.path.display(), error = %e, "failed to delete expired state file");
                } else {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

fn file_age_days(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some((Utc::now() - modified).num_days())
}

fn parse_state_file_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(".json")?;
    let mut parts = stem.splitn(3, '_');
    let run_id = parts.next()?.parse().ok()?;
    let attempt_id = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((run_id, attempt_id))
}

/// What a recovery attempt replays and what it re-executes.
#[derive(Debug)]
pub struct RecoveryPlan {
    pub run_id: u32,
    pub attempt_id: u32,
    pub run_start_time: DateTime<Utc>,
    /// Actions that succeeded or skipped in the prior attempt, keyed with
    /// their recorded info; their result subfeeds seed the board.
    pub completed: HashMap<ActionId, ActionRunInfo>,
    /// Mode results of actions that will re-execute, replayed verbatim.
    pub mode_results: HashMap<ActionId, ModeResult>,
}

impl Default for RecoveryPlan {
    fn default() -> Self {
        Self {
            run_id: 1,
            attempt_id: 1,
            run_start_time: Utc::now(),
            completed: HashMap::new(),
            mode_results: HashMap::new(),
        }
    }
}

/// Plans the next attempt from the previous run state. Returns `None` when
/// the previous attempt fully succeeded: the next invocation is a fresh run
/// and recovery is a no-op.
pub fn plan_recovery(previous: &RunState) -> Option<RecoveryPlan> {
    if previous.is_succeeded() {
        return None;
    }
    let mut plan = RecoveryPlan {
        run_id: previous.run_id,
        attempt_id: previous.attempt_id + 1,
        run_start_time: previous.run_start_time,
        completed: HashMap::new(),
        mode_results: HashMap::new(),
    };
    for (id, info) in &previous.actions_state {
        if info.state.is_final_success() {
            plan.completed.insert(id.clone(), info.clone());
        } else if let Some(mode_result) = &info.mode_result {
            plan.mode_results.insert(id.clone(), mode_result.clone());
        }
    }
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::DataObjectId;
    use crate::partition::PartitionValues;
    use tempfile::TempDir;

    fn state(run_id: u32, attempt_id: u32) -> RunState {
        RunState::new("app", run_id, attempt_id, Utc::now(), Utc::now())
    }

    fn succeeded_info() -> ActionRunInfo {
        ActionRunInfo {
            state: ActionState::Succeeded,
            results: vec![SubFeed::new(DataObjectId::new("tgt"))
                .with_partition_values(vec![PartitionValues::single("dt", "20180101")])],
            ..ActionRunInfo::pending()
        }
    }

    #[test]
    fn save_then_recover_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path(), "app", RetentionConfig::default()).unwrap();
        let mut s = state(1, 1);
        s.actions_state
            .insert(ActionId::new("a"), succeeded_info());
        let path = store.save(&s).unwrap();
        let recovered = StateStore::recover_run_state(&path).unwrap();
        assert_eq!(recovered.run_id, 1);
        assert_eq!(recovered.actions_state[&ActionId::new("a")].state, ActionState::Succeeded);
    }

    #[test]
    fn unknown_fields_survive_a_roundtrip() {
        let body = r#"{
            "schema_version": 1,
            "app_name": "app",
            "run_id": 2,
            "attempt_id": 1,
            "run_start_time": "2026-01-01T00:00:00Z",
            "attempt_start_time": "2026-01-01T00:00:00Z",
            "actions_state": {},
            "future_field": {"keep": "me"}
        }"#;
        let parsed: RunState = serde_json::from_str(body).unwrap();
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["future_field"]["keep"], "me");
    }

    #[test]
    fn listing_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path(), "app", RetentionConfig::default()).unwrap();
        store.save(&state(1, 1)).unwrap();
        store.save(&state(1, 2)).unwrap();
        store.save(&state(2, 1)).unwrap();
        let refs = store.list_states().unwrap();
        assert_eq!(
            refs.iter().map(|r| (r.run_id, r.attempt_id)).collect::<Vec<_>>(),
            vec![(2, 1), (1, 2), (1, 1)]
        );
    }

    #[test]
    fn retention_by_count_keeps_the_newest_files() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(
            dir.path(),
            "app",
            RetentionConfig {
                max_files: Some(2),
                max_age_days: None,
            },
        )
        .unwrap();
        for run in 1..=4 {
            store.save(&state(run, 1)).unwrap();
        }
        let deleted = store.cleanup().unwrap();
        assert_eq!(deleted, 2);
        let refs = store.list_states().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].run_id, 4);
    }

    #[test]
    fn recovery_of_a_succeeded_state_is_a_noop() {
        let mut s = state(3, 1);
        s.actions_state
            .insert(ActionId::new("a"), succeeded_info());
        assert!(plan_recovery(&s).is_none());
    }

    #[test]
    fn recovery_replays_successes_and_mode_results() {
        let mut s = state(1, 1);
        s.actions_state
            .insert(ActionId::new("a"), succeeded_info());
        let failed = ActionRunInfo {
            state: ActionState::Failed,
            mode_result: Some(ModeResult::from_partition_values(vec![
                PartitionValues::single("dt", "20180101"),
            ])),
            ..ActionRunInfo::pending()
        };
        s.actions_state.insert(ActionId::new("b"), failed);

        let plan = plan_recovery(&s).unwrap();
        assert_eq!(plan.run_id, 1);
        assert_eq!(plan.attempt_id, 2);
        assert!(plan.completed.contains_key(&ActionId::new("a")));
        assert_eq!(
            plan.mode_results[&ActionId::new("b")].partition_values,
            vec![PartitionValues::single("dt", "20180101")]
        );
    }
}
