//! The per-action kernel.
//!
//! An action reads N input subfeeds, optionally transforms, and writes M
//! output subfeeds. The kernel drives one action through a phase: project
//! incoming partition values, decide skipping, select the main input, apply
//! the execution mode (init only, cached for exec), seed the output
//! subfeeds, and during exec read, transform, write and report metrics.
//!
//! The kernel never schedules anything; ordering, parallelism and state
//! persistence are the DAG scheduler's concern.

use crate::context::{ExecutionPhase, RunContext};
use crate::dataobject::{
    require_mergeable, require_partitioned, require_readable, require_streamable,
    require_writable, CanMerge, CanRead, CanReadStream, CanWrite, DataObject, SaveMode,
    Transactional,
};
use crate::error::{DpoError, Result};
use crate::execmode::{ExecutionMode, ModeInput, ModeResult, OPT_CHECKPOINT, OPT_CHECKPOINT_NEXT};
use crate::expression;
use crate::frame::DataFrame;
use crate::id::{ActionId, DataObjectId};
use crate::partition::{self, PartitionValues};
use crate::registry::InstanceRegistry;
use crate::subfeed::SubFeed;
use crate::transform::TransformerChain;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ActionMetadata {
    /// Label matched by the CLI feed selector.
    pub feed: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

pub type PartitionValuesTransformFn =
    dyn Fn(&[PartitionValues]) -> Result<Vec<PartitionValues>> + Send + Sync;

pub struct Action {
    pub id: ActionId,
    pub inputs: Vec<DataObjectId>,
    pub outputs: Vec<DataObjectId>,
    /// Edges where the action reads an object it also writes. Not part of
    /// the DAG ordering; the read happens strictly before the write.
    pub recursive_inputs: Vec<DataObjectId>,
    pub main_input_id: Option<DataObjectId>,
    pub main_output_id: Option<DataObjectId>,
    pub execution_mode: Option<ExecutionMode>,
    /// Overrides the default skip behavior: true executes the action even
    /// when every input is skipped, false skips it unconditionally.
    pub execution_condition: Option<String>,
    /// Aborts the action when true for the selected partition values.
    pub fail_condition: Option<String>,
    pub metadata: ActionMetadata,
    pub transformer: TransformerChain,
    pub inputs_to_ignore_filter: Vec<DataObjectId>,
    pub handle_recursive_inputs_as_subfeeds: bool,
    /// Maps the main input's partition values onto the outputs, identity by
    /// default.
    pub partition_values_transform: Option<Arc<PartitionValuesTransformFn>>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("recursive_inputs", &self.recursive_inputs)
            .field("execution_mode", &self.execution_mode)
            .field("feed", &self.metadata.feed)
            .finish_non_exhaustive()
    }
}

/// What the kernel hands back to the scheduler for one phase.
pub struct ActionOutcome {
    pub subfeeds: Vec<SubFeed>,
    /// False when the action skipped instead of executing.
    pub executed: bool,
}

impl Action {
    pub fn new(
        id: impl Into<ActionId>,
        inputs: Vec<DataObjectId>,
        outputs: Vec<DataObjectId>,
        feed: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            recursive_inputs: Vec::new(),
            main_input_id: None,
            main_output_id: None,
            execution_mode: None,
            execution_condition: None,
            fail_condition: None,
            metadata: ActionMetadata {
                feed: feed.into(),
                name: None,
                description: None,
            },
            transformer: TransformerChain::identity(),
            inputs_to_ignore_filter: Vec::new(),
            handle_recursive_inputs_as_subfeeds: true,
            partition_values_transform: None,
        }
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn with_transformer(mut self, transformer: TransformerChain) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn feed(&self) -> &str {
        &self.metadata.feed
    }

    /// The output whose partition scheme drives mode computation: the
    /// explicitly configured one, else the first declared output.
    pub fn main_output_id(&self) -> DataObjectId {
        self.main_output_id
            .clone()
            .unwrap_or_else(|| self.outputs[0].clone())
    }

    /// Candidates for the main input: the configured one, else all inputs
    /// sorted by descending partition-column count.
    pub fn main_input_candidates(
        &self,
        registry: &InstanceRegistry,
    ) -> Result<Vec<DataObjectId>> {
        if let Some(id) = &self.main_input_id {
            return Ok(vec![id.clone()]);
        }
        let mut candidates: Vec<(usize, usize, DataObjectId)> = Vec::new();
        for (position, id) in self.inputs.iter().enumerate() {
            let columns = registry.data_object(id)?.partition_columns().len();
            candidates.push((columns, position, id.clone()));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(candidates.into_iter().map(|(_, _, id)| id).collect())
    }

    /// The first non-skipped candidate at execution time, else the first
    /// candidate.
    fn select_main_input(
        &self,
        subfeeds: &[SubFeed],
        registry: &InstanceRegistry,
    ) -> Result<DataObjectId> {
        let candidates = self.main_input_candidates(registry)?;
        let selected = candidates
            .iter()
            .find(|id| {
                subfeeds
                    .iter()
                    .any(|sf| &sf.data_object_id == *id && !sf.is_skipped)
            })
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                DpoError::config(format!("action {} has no main input candidate", self.id))
            })?;
        Ok(selected)
    }

    /// Structural validation against the registry, run once in prepare.
    pub fn validate_config(&self, registry: &InstanceRegistry) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(DpoError::config(format!("action {} has no inputs", self.id)));
        }
        if self.outputs.is_empty() {
            return Err(DpoError::config(format!("action {} has no outputs", self.id)));
        }
        for id in &self.inputs {
            let obj = registry.data_object(id)?;
            require_readable(obj)?;
        }
        for id in &self.outputs {
            let obj = registry.data_object(id)?;
            let writable = require_writable(obj)?;
            if writable.save_mode() == SaveMode::Merge {
                require_mergeable(obj)?;
            }
        }
        for id in &self.recursive_inputs {
            if !self.outputs.contains(id) {
                return Err(DpoError::config(format!(
                    "recursive input '{}' of action {} is not an output of the same action",
                    id, self.id
                )));
            }
            require_readable(registry.data_object(id)?)?;
        }
        if let Some(id) = &self.main_input_id {
            if !self.inputs.contains(id) {
                return Err(DpoError::config(format!(
                    "main input '{}' of action {} is not one of its inputs",
                    id, self.id
                )));
            }
        }
        if let Some(id) = &self.main_output_id {
            if !self.outputs.contains(id) {
                return Err(DpoError::config(format!(
                    "main output '{}' of action {} is not one of its outputs",
                    id, self.id
                )));
            }
        }
        if !self.handle_recursive_inputs_as_subfeeds && !self.recursive_inputs.is_empty() {
            warn!(
                action = %self.id,
                "recursive inputs are not passed to the transformation, outputs are validated against non-recursive inputs only"
            );
        }
        self.validate_mode(registry)
    }

    fn validate_mode(&self, registry: &InstanceRegistry) -> Result<()> {
        let Some(mode) = &self.execution_mode else {
            return Ok(());
        };
        let main_input = registry.data_object(&self.main_input_hint(registry)?)?;
        match mode {
            ExecutionMode::PartitionDiff(diff) => {
                require_partitioned(main_input)?;
                let compare_id = diff
                    .alternative_output_id
                    .clone()
                    .unwrap_or_else(|| self.main_output_id());
                require_partitioned(registry.data_object(&compare_id)?)?;
            }
            ExecutionMode::StreamingOnce { .. } => {
                require_streamable(main_input)?;
            }
            ExecutionMode::Incremental { .. } => {
                require_readable(registry.data_object(&self.main_output_id())?)?;
            }
            ExecutionMode::Custom { name } => {
                registry.custom_mode(name)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Main input chosen without subfeeds, for validation before any run.
    fn main_input_hint(&self, registry: &InstanceRegistry) -> Result<DataObjectId> {
        Ok(self.main_input_candidates(registry)?.remove(0))
    }

    /// Prepare phase: structural validation plus backend existence checks.
    /// No data is read.
    pub async fn prepare(&self, ctx: &RunContext) -> Result<()> {
        self.validate_config(&ctx.registry)?;
        let mut seen = Vec::new();
        for id in self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.recursive_inputs.iter())
        {
            if seen.contains(id) {
                continue;
            }
            seen.push(id.clone());
            ctx.registry.data_object(id)?.prepare().await?;
        }
        debug!(action = %self.id, "prepared");
        Ok(())
    }

    /// Runs the init or exec phase for this action.
    pub async fn run_phase(
        &self,
        phase: ExecutionPhase,
        input_subfeeds: Vec<SubFeed>,
        ctx: &RunContext,
    ) -> Result<ActionOutcome> {
        if phase == ExecutionPhase::Exec && ctx.is_marked_skipped(&self.id) {
            return Ok(self.skipped_outcome());
        }

        // project incoming partition values onto each input's columns
        let mut subfeeds = Vec::with_capacity(input_subfeeds.len());
        for sf in input_subfeeds {
            let obj = ctx.registry.data_object(&sf.data_object_id)?;
            subfeeds.push(sf.project(&obj.partition_columns()));
        }

        let all_skipped = !subfeeds.is_empty() && subfeeds.iter().all(|sf| sf.is_skipped);
        match &self.execution_condition {
            Some(condition) => {
                let doc = self.expression_doc(&subfeeds, None, ctx);
                if !expression::evaluate_bool(condition, &doc)? {
                    info!(action = %self.id, %condition, "execution condition false, skipping");
                    return Ok(self.skipped_outcome());
                }
                if all_skipped {
                    // forced execution on skipped inputs reads the full objects
                    subfeeds = subfeeds.into_iter().map(SubFeed::reset_skipped).collect();
                }
            }
            None => {
                if all_skipped {
                    info!(action = %self.id, "all inputs skipped, skipping");
                    return Ok(self.skipped_outcome());
                }
            }
        }

        let main_input_id = self.select_main_input(&subfeeds, &ctx.registry)?;
        let main_idx = subfeeds
            .iter()
            .position(|sf| sf.data_object_id == main_input_id)
            .ok_or_else(|| {
                DpoError::config(format!(
                    "action {} received no subfeed for main input '{}'",
                    self.id, main_input_id
                ))
            })?;

        let mut mode_result = match phase {
            ExecutionPhase::Init => match self.apply_execution_mode(&subfeeds, main_idx, ctx).await
            {
                Ok(result) => result,
                Err(DpoError::NoDataDontStop { .. }) => {
                    info!(action = %self.id, "no data to process, emitting skipped subfeeds");
                    ctx.mark_skipped(&self.id);
                    return Ok(self.skipped_outcome());
                }
                Err(e) => return Err(e),
            },
            _ => ctx.cached_mode_result(&self.id),
        };
        if let Some(result) = &mode_result {
            subfeeds[main_idx] = subfeeds[main_idx].apply_mode_result(result);
        }

        if let Some(condition) = &self.fail_condition {
            let doc = self.expression_doc(
                &subfeeds,
                Some(&subfeeds[main_idx].partition_values),
                ctx,
            );
            if expression::evaluate_bool(condition, &doc)? {
                return Err(DpoError::task(
                    self.id.clone(),
                    anyhow::anyhow!("fail condition '{}' evaluated true", condition),
                ));
            }
        }

        let output_subfeeds = self.seed_output_subfeeds(&subfeeds[main_idx], ctx)?;
        if phase == ExecutionPhase::Init {
            return Ok(ActionOutcome {
                subfeeds: output_subfeeds,
                executed: true,
            });
        }

        match self
            .execute(subfeeds, main_idx, output_subfeeds, &mut mode_result, ctx)
            .await
        {
            Err(DpoError::NoDataDontStop { .. }) => {
                info!(action = %self.id, "no data to process, emitting skipped subfeeds");
                ctx.mark_skipped(&self.id);
                Ok(self.skipped_outcome())
            }
            other => other,
        }
    }

    async fn apply_execution_mode(
        &self,
        subfeeds: &[SubFeed],
        main_idx: usize,
        ctx: &RunContext,
    ) -> Result<Option<ModeResult>> {
        if let Some(cached) = ctx.cached_mode_result(&self.id) {
            return Ok(Some(cached));
        }
        let Some(mode) = &self.execution_mode else {
            return Ok(None);
        };
        let main_input = Arc::clone(ctx.registry.data_object(&subfeeds[main_idx].data_object_id)?);
        let main_output = Arc::clone(ctx.registry.data_object(&self.main_output_id())?);
        let doc = self.expression_doc(subfeeds, None, ctx);
        let input = ModeInput {
            action_id: &self.id,
            main_input: &main_input,
            main_output: &main_output,
            subfeed: &subfeeds[main_idx],
            context_doc: &doc,
            registry: &ctx.registry,
            app_partition_values: &ctx.app_partition_values,
        };
        let result = mode.apply(&input).await?;
        if let Some(result) = &result {
            ctx.cache_mode_result(&self.id, result.clone());
        }
        Ok(result)
    }

    /// One output subfeed per declared output, carrying the main input's
    /// partition values mapped through the partition-values transform and
    /// projected onto the output's partition columns.
    fn seed_output_subfeeds(
        &self,
        main_subfeed: &SubFeed,
        ctx: &RunContext,
    ) -> Result<Vec<SubFeed>> {
        let transformed = match &self.partition_values_transform {
            Some(transform) => transform(&main_subfeed.partition_values)?,
            None => main_subfeed.partition_values.clone(),
        };
        self.outputs
            .iter()
            .map(|id| {
                let obj = ctx.registry.data_object(id)?;
                Ok(SubFeed::new(id.clone()).with_partition_values(partition::project_all(
                    &transformed,
                    &obj.partition_columns(),
                )))
            })
            .collect()
    }

    async fn execute(
        &self,
        subfeeds: Vec<SubFeed>,
        main_idx: usize,
        mut output_subfeeds: Vec<SubFeed>,
        mode_result: &mut Option<ModeResult>,
        ctx: &RunContext,
    ) -> Result<ActionOutcome> {
        let streaming = matches!(
            self.execution_mode,
            Some(ExecutionMode::StreamingOnce { .. })
        );

        let mut frames: HashMap<String, DataFrame> = HashMap::new();
        for (idx, sf) in subfeeds.iter().enumerate() {
            let obj = ctx.registry.data_object(&sf.data_object_id)?;
            let df = if streaming && idx == main_idx {
                let checkpoint = mode_result
                    .as_ref()
                    .and_then(|r| r.options.get(OPT_CHECKPOINT).cloned());
                let (df, next) = require_streamable(obj)?
                    .read_increment(checkpoint.as_deref())
                    .await
                    .map_err(|e| self.as_task_error(e))?;
                if let Some(next) = next {
                    let mut updated = mode_result.clone().unwrap_or_default();
                    updated
                        .options
                        .insert(OPT_CHECKPOINT_NEXT.to_string(), next);
                    ctx.cache_mode_result(&self.id, updated.clone());
                    *mode_result = Some(updated);
                }
                df
            } else if let Some(payload) = &sf.payload {
                payload.filter_partitions(&sf.partition_values)
            } else {
                let filter = if self.inputs_to_ignore_filter.contains(&sf.data_object_id) {
                    None
                } else {
                    sf.filter.as_deref()
                };
                require_readable(obj)?
                    .read(&sf.partition_values, filter)
                    .await
                    .map_err(|e| self.as_task_error(e))?
            };
            debug!(action = %self.id, input = %sf.data_object_id, rows = df.num_rows(), "read input");
            frames.insert(sf.data_object_id.to_string(), df);
        }

        // recursive inputs are read strictly before any output is written
        if self.handle_recursive_inputs_as_subfeeds {
            for id in &self.recursive_inputs {
                let obj = ctx.registry.data_object(id)?;
                let df = require_readable(obj)?
                    .read(&[], None)
                    .await
                    .map_err(|e| self.as_task_error(e))?;
                frames.insert(id.to_string(), df);
            }
        }

        let expected_outputs: Vec<String> = self
            .outputs
            .iter()
            .filter(|id| {
                self.handle_recursive_inputs_as_subfeeds || !self.recursive_inputs.contains(id)
            })
            .map(|id| id.to_string())
            .collect();

        let doc = self.expression_doc(
            &subfeeds,
            Some(&subfeeds[main_idx].partition_values),
            ctx,
        );
        let main_input_key = subfeeds[main_idx].data_object_id.to_string();
        let result_frames = if self.transformer.is_identity() {
            let main_df = frames.get(&main_input_key).cloned().unwrap_or_default();
            expected_outputs
                .iter()
                .map(|id| (id.clone(), main_df.clone()))
                .collect()
        } else {
            self.transformer
                .apply(&self.id, frames, &expected_outputs, &doc)?
        };

        for sf in &mut output_subfeeds {
            let Some(df) = result_frames.get(sf.data_object_id.as_str()) else {
                // recursive output not handled as subfeed, nothing to write
                continue;
            };
            let metrics = self.write_output(sf, df, ctx).await?;
            ctx.metrics.record(&self.id, &sf.data_object_id, metrics);
            sf.payload = Some(df.clone());
        }

        if let Some(mode) = &self.execution_mode {
            let main_output_id = self.main_output_id();
            let main_output_subfeed = output_subfeeds
                .iter()
                .find(|sf| sf.data_object_id == main_output_id)
                .unwrap_or(&output_subfeeds[0]);
            mode.post_exec(mode_result.as_ref(), &subfeeds[main_idx], main_output_subfeed)
                .await?;
        }

        Ok(ActionOutcome {
            subfeeds: output_subfeeds,
            executed: true,
        })
    }

    async fn write_output(
        &self,
        subfeed: &SubFeed,
        df: &DataFrame,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, Value>> {
        let obj = ctx.registry.data_object(&subfeed.data_object_id)?;
        let writable = require_writable(obj)?;
        let started = Instant::now();

        if let Some(tx) = obj.transactional() {
            tx.begin().await?;
        }
        let write_result = match writable.save_mode() {
            SaveMode::Merge => require_mergeable(obj)?.merge(df).await,
            _ => writable.write(df, &subfeed.partition_values).await,
        };
        let write_metrics = match write_result {
            Ok(metrics) => {
                if let Some(tx) = obj.transactional() {
                    tx.commit().await?;
                }
                metrics
            }
            Err(e) => {
                if let Some(tx) = obj.transactional() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(action = %self.id, output = %subfeed.data_object_id, error = %rollback_err, "rollback failed");
                    }
                }
                return Err(self.as_task_error(e));
            }
        };

        info!(
            action = %self.id,
            output = %subfeed.data_object_id,
            rows = write_metrics.rows_inserted + write_metrics.rows_updated,
            partitions = write_metrics.partitions_written,
            "written output"
        );
        let mut metrics = write_metrics.into_map();
        metrics.insert(
            "duration_ms".to_string(),
            Value::from(started.elapsed().as_millis() as u64),
        );
        Ok(metrics)
    }

    /// Hard errors crossing the action boundary become task failures keyed
    /// by this action; configuration and soft errors keep their class.
    fn as_task_error(&self, e: DpoError) -> DpoError {
        match e {
            DpoError::Config(_)
            | DpoError::Precondition { .. }
            | DpoError::TaskFailed { .. }
            | DpoError::NoDataDontStop { .. }
            | DpoError::NoDataStop => e,
            other => DpoError::task(self.id.clone(), anyhow::anyhow!(other)),
        }
    }

    fn skipped_outcome(&self) -> ActionOutcome {
        ActionOutcome {
            subfeeds: self
                .outputs
                .iter()
                .map(|id| SubFeed::new(id.clone()).into_skipped())
                .collect(),
            executed: false,
        }
    }

    /// Context document for condition evaluation and runtime options.
    fn expression_doc(
        &self,
        subfeeds: &[SubFeed],
        selected: Option<&[PartitionValues]>,
        ctx: &RunContext,
    ) -> Value {
        let mut doc = match ctx.base_expression_doc(&self.metadata.feed) {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        doc.insert(
            "is_dag_start".to_string(),
            Value::Bool(subfeeds.iter().any(|sf| sf.is_dag_start)),
        );
        let skipped: serde_json::Map<String, Value> = subfeeds
            .iter()
            .map(|sf| (sf.data_object_id.to_string(), Value::Bool(sf.is_skipped)))
            .collect();
        doc.insert("is_skipped".to_string(), Value::Object(skipped));
        let input_pvs: Vec<Value> = subfeeds
            .iter()
            .flat_map(|sf| sf.partition_values.iter().map(|pv| pv.to_json()))
            .collect();
        doc.insert("input_partition_values".to_string(), Value::Array(input_pvs));
        if let Some(selected) = selected {
            doc.insert(
                "selected_partition_values".to_string(),
                Value::Array(selected.iter().map(|pv| pv.to_json()).collect()),
            );
        }
        doc.insert(
            "options".to_string(),
            Value::Object(
                self.transformer
                    .options
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        Value::Object(doc)
    }
}
