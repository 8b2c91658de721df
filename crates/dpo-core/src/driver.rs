//! The driver loop.
//!
//! Selects actions by feed, figures out run and attempt ids against the
//! state store, seeds DAG-start subfeeds from the command-line partition
//! filter, walks the three phases and surfaces an exit status. Recovery is
//! planned here: succeeded actions of a failed attempt are replayed from
//! their recorded subfeeds, everything else re-executes with the mode
//! results the prior attempt selected.

use crate::action::Action;
use crate::context::{ExecutionPhase, RunContext};
use crate::dag::{ActionDag, DagScheduler, SchedulerConfig};
use crate::dataobject::DataObject;
use crate::error::{DpoError, Result};
use crate::id::DataObjectId;
use crate::partition::{self, PartitionValues};
use crate::registry::InstanceRegistry;
use crate::state::{
    plan_recovery, ActionRunInfo, RetentionConfig, RunState, StateStore,
};
use crate::subfeed::SubFeed;
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Stop after prepare (`Config`) or after init (`DryRun`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Config,
    DryRun,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub app_name: String,
    /// Regex matched against each action's feed.
    pub feed_sel: String,
    pub partition_values: Vec<PartitionValues>,
    pub parallelism: usize,
    pub continue_on_failure: bool,
    pub action_timeout: Option<Duration>,
    /// Enables the state store and recovery.
    pub state_path: Option<PathBuf>,
    pub retention: RetentionConfig,
    pub test_mode: Option<TestMode>,
    pub config_digest: Option<String>,
}

impl DriverConfig {
    pub fn new(app_name: impl Into<String>, feed_sel: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            feed_sel: feed_sel.into(),
            partition_values: Vec::new(),
            parallelism: 1,
            continue_on_failure: false,
            action_timeout: None,
            state_path: None,
            retention: RetentionConfig::default(),
            test_mode: None,
            config_digest: None,
        }
    }

    pub fn with_partition_values(mut self, values: Vec<PartitionValues>) -> Self {
        self.partition_values = values;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
}

pub struct RunOutcome {
    /// 0 success (including no data), 1 configuration error, 2 execution
    /// failure.
    pub exit_code: i32,
    pub state: Option<RunState>,
    pub error: Option<String>,
}

pub struct Driver {
    config: DriverConfig,
    registry: Arc<InstanceRegistry>,
    actions: Vec<Arc<Action>>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        registry: Arc<InstanceRegistry>,
        actions: Vec<Arc<Action>>,
    ) -> Self {
        Self {
            config,
            registry,
            actions,
        }
    }

    pub async fn run(&self) -> RunOutcome {
        self.run_with_cancel(CancellationToken::new()).await
    }

    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> RunOutcome {
        match self.run_inner(cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "run aborted");
                RunOutcome {
                    exit_code: e.exit_code().max(1),
                    state: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_inner(&self, cancel: CancellationToken) -> Result<RunOutcome> {
        let selected = select_actions(&self.actions, &self.config.feed_sel)?;
        info!(
            feed_sel = %self.config.feed_sel,
            actions = selected.len(),
            "selected actions"
        );
        // validates the full selection, including cycles
        ActionDag::new(selected.clone())?;

        let store = match &self.config.state_path {
            Some(path) => Some(StateStore::new(
                path,
                &self.config.app_name,
                self.config.retention.clone(),
            )?),
            None => None,
        };

        let mut completed: HashMap<_, ActionRunInfo> = HashMap::new();
        let mut replayed_modes = HashMap::new();
        let (run_id, attempt_id, run_start_time) = match &store {
            Some(store) => match store.get_latest_state()? {
                Some(latest) => {
                    let previous = StateStore::recover_run_state(&latest.path)?;
                    match plan_recovery(&previous) {
                        Some(plan) => {
                            info!(
                                run_id = plan.run_id,
                                attempt_id = plan.attempt_id,
                                replayed = plan.completed.len(),
                                "recovering failed run"
                            );
                            completed = plan.completed;
                            replayed_modes = plan.mode_results;
                            (plan.run_id, plan.attempt_id, plan.run_start_time)
                        }
                        None => (previous.run_id + 1, 1, Utc::now()),
                    }
                }
                None => (1, 1, Utc::now()),
            },
            None => (1, 1, Utc::now()),
        };

        let to_execute: Vec<Arc<Action>> = selected
            .iter()
            .filter(|action| !completed.contains_key(&action.id))
            .cloned()
            .collect();
        let dag = ActionDag::new(to_execute)?;

        let ctx = Arc::new(
            RunContext::new(
                self.config.app_name.clone(),
                run_id,
                attempt_id,
                run_start_time,
                self.config.partition_values.clone(),
                Arc::clone(&self.registry),
            )
            .with_replayed_mode_results(replayed_modes),
        );

        let mut run_state = RunState::new(
            self.config.app_name.clone(),
            run_id,
            attempt_id,
            run_start_time,
            ctx.attempt_start_time,
        );
        run_state.config_digest = self.config.config_digest.clone();
        for action in &selected {
            run_state
                .actions_state
                .insert(action.id.clone(), ActionRunInfo::pending());
        }
        for (id, info) in &completed {
            run_state.actions_state.insert(id.clone(), info.clone());
        }

        let mut board: HashMap<DataObjectId, SubFeed> = HashMap::new();
        for input_id in dag.start_input_ids() {
            let obj = self.registry.data_object(&input_id)?;
            let subfeed = SubFeed::new(input_id.clone())
                .with_partition_values(partition::project_all(
                    &self.config.partition_values,
                    &obj.partition_columns(),
                ))
                .dag_start();
            board.insert(input_id, subfeed);
        }
        for info in completed.values() {
            for subfeed in &info.results {
                board.insert(subfeed.data_object_id.clone(), subfeed.clone());
            }
        }

        let scheduler = DagScheduler::new(SchedulerConfig {
            parallelism: self.config.parallelism,
            continue_on_failure: self.config.continue_on_failure,
            action_timeout: self.config.action_timeout,
        });

        info!(run_id, attempt_id, "prepare phase");
        scheduler.run_prepare(&dag, &ctx).await?;
        if self.config.test_mode == Some(TestMode::Config) {
            info!("configuration test passed");
            return Ok(RunOutcome {
                exit_code: 0,
                state: Some(run_state),
                error: None,
            });
        }

        info!(run_id, attempt_id, "init phase");
        let (_, init_error) = scheduler
            .run_phase(
                &dag,
                ExecutionPhase::Init,
                &board,
                &ctx,
                &mut run_state,
                None,
                &cancel,
            )
            .await;
        record_mode_results(&ctx, &mut run_state);
        if let Some(e) = init_error {
            run_state.end_time = Some(Utc::now());
            if self.config.test_mode.is_none() {
                if let Some(store) = &store {
                    store.save(&run_state)?;
                }
            }
            // a run ending early for lack of data is a success
            let exit_code = match e {
                DpoError::NoDataStop => 0,
                _ => e.exit_code().max(1),
            };
            return Ok(RunOutcome {
                exit_code,
                error: (exit_code != 0).then(|| e.to_string()),
                state: Some(run_state),
            });
        }
        if self.config.test_mode == Some(TestMode::DryRun) {
            info!("dry run passed, nothing was written");
            return Ok(RunOutcome {
                exit_code: 0,
                state: Some(run_state),
                error: None,
            });
        }

        // init marked every action succeeded; exec starts from pending
        // again, keeping the selected mode results
        for id in dag.topo_order() {
            if let Some(entry) = run_state.actions_state.get_mut(id) {
                let mode_result = entry.mode_result.take();
                *entry = ActionRunInfo::pending();
                entry.mode_result = mode_result;
            }
        }

        info!(run_id, attempt_id, "exec phase");
        let (_, exec_error) = scheduler
            .run_phase(
                &dag,
                ExecutionPhase::Exec,
                &board,
                &ctx,
                &mut run_state,
                store.as_ref(),
                &cancel,
            )
            .await;
        record_mode_results(&ctx, &mut run_state);
        run_state.end_time = Some(Utc::now());
        if let Some(store) = &store {
            store.save(&run_state)?;
            let deleted = store.cleanup()?;
            if deleted > 0 {
                info!(deleted, "applied state retention");
            }
        }

        match exec_error {
            Some(e) => {
                let exit_code = e.exit_code();
                Ok(RunOutcome {
                    exit_code,
                    error: (exit_code != 0).then(|| e.to_string()),
                    state: Some(run_state),
                })
            }
            None => {
                info!(run_id, attempt_id, "run succeeded");
                Ok(RunOutcome {
                    exit_code: 0,
                    error: None,
                    state: Some(run_state),
                })
            }
        }
    }
}

/// Actions whose feed matches the selector regex.
fn select_actions(actions: &[Arc<Action>], feed_sel: &str) -> Result<Vec<Arc<Action>>> {
    let regex = Regex::new(feed_sel)
        .map_err(|e| DpoError::config(format!("invalid feed selector '{}': {}", feed_sel, e)))?;
    let selected: Vec<Arc<Action>> = actions
        .iter()
        .filter(|action| regex.is_match(action.feed()))
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(DpoError::config(format!(
            "no actions selected by feed selector '{}'",
            feed_sel
        )));
    }
    Ok(selected)
}

fn record_mode_results(ctx: &RunContext, run_state: &mut RunState) {
    for (id, result) in ctx.mode_results_snapshot() {
        if let Some(entry) = run_state.actions_state.get_mut(&id) {
            if entry.mode_result.is_none() {
                entry.mode_result = Some(result);
            }
        }
    }
}
