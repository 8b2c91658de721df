//! The action DAG and its three-phase scheduler.
//!
//! Actions are nodes, data objects the edges between them: an edge exists
//! from the producer of a data object to every action consuming it.
//! Recursive inputs are kept out of the ordering. The scheduler walks the
//! graph three times with global barriers between the phases:
//!
//! 1. prepare: connection tests and structural validation, no data read
//! 2. init: every action plans its work, execution modes run and cache
//! 3. exec: materialize and write, persisting run state after every action
//!
//! Within a phase, actions with no unresolved dependencies are dispatched
//! concurrently up to the configured parallelism. Failures cancel the
//! failing action's descendants; fail-fast additionally stops dispatching
//! anything new while in-flight actions run to completion.

use crate::action::{Action, ActionOutcome};
use crate::connection::Connection;
use crate::context::{ExecutionPhase, RunContext};
use crate::error::{DpoError, Result};
use crate::id::{ActionId, DataObjectId};
use crate::state::{ActionRunInfo, ActionState, RunState, StateStore};
use crate::subfeed::SubFeed;
use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ActionDag {
    actions: HashMap<ActionId, Arc<Action>>,
    graph: DiGraph<ActionId, ()>,
    index: HashMap<ActionId, NodeIndex>,
    topo: Vec<ActionId>,
}

impl ActionDag {
    /// Builds and validates the graph. Duplicate writers of a data object,
    /// duplicate action ids and cycles over non-recursive edges are
    /// configuration errors.
    pub fn new(actions: Vec<Arc<Action>>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut by_id = HashMap::new();
        for action in &actions {
            if by_id.contains_key(&action.id) {
                return Err(DpoError::config(format!("duplicate action id '{}'", action.id)));
            }
            let node = graph.add_node(action.id.clone());
            index.insert(action.id.clone(), node);
            by_id.insert(action.id.clone(), Arc::clone(action));
        }

        let mut producers: HashMap<DataObjectId, ActionId> = HashMap::new();
        for action in &actions {
            for output in &action.outputs {
                if let Some(existing) = producers.insert(output.clone(), action.id.clone()) {
                    return Err(DpoError::config(format!(
                        "data object '{}' is written by both {} and {}",
                        output, existing, action.id
                    )));
                }
            }
        }
        for action in &actions {
            for input in &action.inputs {
                if let Some(producer) = producers.get(input) {
                    graph.add_edge(index[producer], index[&action.id], ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let id = graph[cycle.node_id()].clone();
            DpoError::config(format!("action graph contains a cycle through {}", id))
        })?;
        let topo = order.into_iter().map(|node| graph[node].clone()).collect();
        Ok(Self {
            actions: by_id,
            graph,
            index,
            topo,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn topo_order(&self) -> &[ActionId] {
        &self.topo
    }

    pub fn action(&self, id: &ActionId) -> Option<&Arc<Action>> {
        self.actions.get(id)
    }

    pub fn predecessor_count(&self, id: &ActionId) -> usize {
        self.graph
            .neighbors_directed(self.index[id], Direction::Incoming)
            .count()
    }

    pub fn successors(&self, id: &ActionId) -> Vec<ActionId> {
        self.graph
            .neighbors_directed(self.index[id], Direction::Outgoing)
            .map(|node| self.graph[node].clone())
            .collect()
    }

    /// All transitive successors.
    pub fn descendants(&self, id: &ActionId) -> HashSet<ActionId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ActionId> = self.successors(id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.successors(&next));
            }
        }
        seen
    }

    /// Data objects consumed by the graph but produced outside of it. Their
    /// subfeeds are synthesized from the driver's partition filter.
    pub fn start_input_ids(&self) -> Vec<DataObjectId> {
        let produced: HashSet<&DataObjectId> = self
            .actions
            .values()
            .flat_map(|a| a.outputs.iter())
            .collect();
        let mut seen = HashSet::new();
        let mut start = Vec::new();
        for id in &self.topo {
            let action = &self.actions[id];
            for input in &action.inputs {
                if !produced.contains(input) && seen.insert(input.clone()) {
                    start.push(input.clone());
                }
            }
        }
        start
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub parallelism: usize,
    pub continue_on_failure: bool,
    pub action_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            continue_on_failure: false,
            action_timeout: None,
        }
    }
}

pub struct DagScheduler {
    config: SchedulerConfig,
}

impl DagScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Prepare phase: one test call per connection, then every action's
    /// structural validation and backend checks in topological order.
    pub async fn run_prepare(&self, dag: &ActionDag, ctx: &RunContext) -> Result<()> {
        for connection in ctx.registry.connections() {
            connection.test().await.map_err(|e| match e {
                DpoError::Config(_) => e,
                other => DpoError::precondition(connection.id(), other.to_string()),
            })?;
            debug!(connection = %connection.id(), "connection tested");
        }
        for id in dag.topo_order() {
            let action = dag.action(id).expect("action in dag");
            action.prepare(ctx).await?;
        }
        Ok(())
    }

    /// Runs one traversal phase over the DAG. Mutates `run_state` as
    /// actions change state and, during exec, persists it after every
    /// change. Returns the output board and the first fatal error.
    pub async fn run_phase(
        &self,
        dag: &ActionDag,
        phase: ExecutionPhase,
        start_board: &HashMap<DataObjectId, SubFeed>,
        ctx: &Arc<RunContext>,
        run_state: &mut RunState,
        store: Option<&StateStore>,
        cancel: &CancellationToken,
    ) -> (HashMap<DataObjectId, SubFeed>, Option<DpoError>) {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut board = start_board.clone();
        let mut running: JoinSet<(ActionId, Result<ActionOutcome>)> = JoinSet::new();
        let mut task_actions: HashMap<tokio::task::Id, ActionId> = HashMap::new();

        // dependency counts of not-yet-dispatched actions
        let mut remaining: HashMap<ActionId, usize> = HashMap::new();
        let mut ready: VecDeque<ActionId> = VecDeque::new();
        for id in dag.topo_order() {
            let deps = dag.predecessor_count(id);
            if deps == 0 {
                ready.push_back(id.clone());
            } else {
                remaining.insert(id.clone(), deps);
            }
        }

        let mut cancelled: HashSet<ActionId> = HashSet::new();
        let mut first_error: Option<DpoError> = None;
        let mut stop_dispatch = false;
        let mut stop_state = ActionState::Cancelled;

        loop {
            if cancel.is_cancelled() && !stop_dispatch {
                warn!(%phase, "cancellation requested, no further actions are dispatched");
                stop_dispatch = true;
                stop_state = ActionState::Cancelled;
                if first_error.is_none() {
                    first_error = Some(DpoError::Cancelled);
                }
            }

            if !stop_dispatch {
                while let Some(id) = ready.pop_front() {
                    if cancelled.contains(&id) {
                        continue;
                    }
                    let action = Arc::clone(dag.action(&id).expect("action in dag"));
                    let mut inputs = Vec::with_capacity(action.inputs.len());
                    let mut missing = None;
                    for input_id in &action.inputs {
                        match board.get(input_id) {
                            Some(sf) => inputs.push(sf.clone()),
                            None => {
                                missing = Some(input_id.clone());
                                break;
                            }
                        }
                    }

                    let entry = run_state
                        .actions_state
                        .entry(id.clone())
                        .or_insert_with(ActionRunInfo::pending);
                    entry.start_time = Some(Utc::now());

                    let task = match missing {
                        Some(input_id) => {
                            let failed_id = id.clone();
                            running.spawn(async move {
                                let e = DpoError::task(
                                    failed_id.clone(),
                                    anyhow::anyhow!("input '{}' is not available", input_id),
                                );
                                (failed_id, Err(e))
                            })
                        }
                        None => {
                            let ctx = Arc::clone(ctx);
                            let semaphore = Arc::clone(&semaphore);
                            let timeout = self.config.action_timeout;
                            running.spawn(async move {
                                let _permit = semaphore.acquire_owned().await;
                                let id = action.id.clone();
                                let fut = action.run_phase(phase, inputs, &ctx);
                                let result = match timeout {
                                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                                        Ok(r) => r,
                                        Err(_) => Err(DpoError::Timeout {
                                            action_id: id.clone(),
                                            timeout_sec: limit.as_secs(),
                                        }),
                                    },
                                    None => fut.await,
                                };
                                (id, result)
                            })
                        }
                    };
                    task_actions.insert(task.id(), id);
                }
            }

            let Some(joined) = running.join_next().await else {
                if ready.is_empty() || stop_dispatch {
                    break;
                }
                continue;
            };

            let (id, result) = match joined {
                Ok((id, result)) => {
                    task_actions.retain(|_, v| v != &id);
                    (id, result)
                }
                Err(join_error) => {
                    let id = task_actions
                        .remove(&join_error.id())
                        .unwrap_or_else(|| ActionId::new("unknown"));
                    let e = DpoError::task(
                        id.clone(),
                        anyhow::anyhow!("action task aborted: {}", join_error),
                    );
                    (id, Err(e))
                }
            };

            match result {
                Ok(outcome) => {
                    let discard = first_error.is_some() && !self.config.continue_on_failure;
                    if !discard {
                        for sf in &outcome.subfeeds {
                            board.insert(sf.data_object_id.clone(), sf.clone());
                        }
                        for successor in dag.successors(&id) {
                            if cancelled.contains(&successor) {
                                continue;
                            }
                            let now_ready = match remaining.get_mut(&successor) {
                                Some(deps) => {
                                    *deps -= 1;
                                    *deps == 0
                                }
                                None => false,
                            };
                            if now_ready {
                                remaining.remove(&successor);
                                ready.push_back(successor);
                            }
                        }
                    }
                    let state = if outcome.executed {
                        ActionState::Succeeded
                    } else {
                        ActionState::Skipped
                    };
                    let entry = run_state
                        .actions_state
                        .entry(id.clone())
                        .or_insert_with(ActionRunInfo::pending);
                    entry.state = state;
                    entry.end_time = Some(Utc::now());
                    entry.results = outcome
                        .subfeeds
                        .iter()
                        .map(|sf| sf.clone().break_lineage())
                        .collect();
                    entry.metrics = ctx.metrics.merged_for_action(&id);
                    entry.mode_result = ctx.cached_mode_result(&id);
                    info!(%phase, action = %id, state = ?state, "action finished");
                }
                Err(DpoError::NoDataStop) => {
                    info!(action = %id, "no data to process, ending the run early");
                    let entry = run_state
                        .actions_state
                        .entry(id.clone())
                        .or_insert_with(ActionRunInfo::pending);
                    entry.state = ActionState::Skipped;
                    entry.end_time = Some(Utc::now());
                    entry.message = Some("no data to process".to_string());
                    stop_dispatch = true;
                    stop_state = ActionState::Skipped;
                    if first_error.is_none() {
                        first_error = Some(DpoError::NoDataStop);
                    }
                }
                Err(e) => {
                    error!(%phase, action = %id, error = %e, "action failed");
                    let entry = run_state
                        .actions_state
                        .entry(id.clone())
                        .or_insert_with(ActionRunInfo::pending);
                    entry.state = ActionState::Failed;
                    entry.end_time = Some(Utc::now());
                    entry.failure_kind = Some(e.kind().to_string());
                    entry.message = Some(e.to_string());
                    entry.mode_result = ctx.cached_mode_result(&id);

                    for descendant in dag.descendants(&id) {
                        mark_cancelled(run_state, &mut cancelled, &descendant);
                    }
                    if !self.config.continue_on_failure {
                        stop_dispatch = true;
                        stop_state = ActionState::Cancelled;
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }

            if stop_dispatch {
                mark_unstarted(run_state, &mut cancelled, &remaining, &ready, stop_state);
                remaining.clear();
                ready.clear();
            }

            if phase == ExecutionPhase::Exec {
                if let Some(store) = store {
                    if let Err(e) = store.save(run_state) {
                        warn!(error = %e, "failed to persist run state");
                    }
                }
            }
        }

        (board, first_error)
    }
}

fn mark_cancelled(run_state: &mut RunState, cancelled: &mut HashSet<ActionId>, id: &ActionId) {
    if !cancelled.insert(id.clone()) {
        return;
    }
    let entry = run_state
        .actions_state
        .entry(id.clone())
        .or_insert_with(ActionRunInfo::pending);
    if entry.state == ActionState::Pending {
        entry.state = ActionState::Cancelled;
    }
}

fn mark_unstarted(
    run_state: &mut RunState,
    cancelled: &mut HashSet<ActionId>,
    remaining: &HashMap<ActionId, usize>,
    ready: &VecDeque<ActionId>,
    state: ActionState,
) {
    for id in remaining.keys().chain(ready.iter()) {
        if cancelled.insert(id.clone()) {
            let entry = run_state
                .actions_state
                .entry(id.clone())
                .or_insert_with(ActionRunInfo::pending);
            if entry.state == ActionState::Pending {
                entry.state = state;
                if state == ActionState::Skipped {
                    entry.message = Some("run stopped early".to_string());
                }
            }
        }
    }
}
