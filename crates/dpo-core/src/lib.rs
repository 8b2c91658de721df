//! # DPO Core - Pipeline Orchestration Engine
//!
//! This crate is the core of DPO, a declarative data pipeline orchestrator.
//! Pipelines are described as data objects (tables, file sets, streams),
//! connections to the stores holding them and actions moving data between
//! them. The core compiles that description into a DAG, decides per action
//! which partitions and rows to process, executes the graph in three phases
//! and records every attempt in a durable state store so a failed run can
//! resume exactly where it stopped.
//!
//! ## Key Components
//!
//! - **SubFeed protocol**: the typed message flowing along DAG edges,
//!   carrying partition values, filters, skip and lineage flags
//! - **Partition-value algebra**: projection, containment and diff over
//!   partition-column records
//! - **Capability contracts**: the narrow traits backends implement
//!   (read, write, partitions, merge, transactions, streaming)
//! - **Execution modes**: strategies selecting the data slice per action,
//!   from fixed partition values to partition diffs and incremental loads
//! - **Action kernel and DAG scheduler**: the per-action state machine and
//!   the three-phase, parallelism-bounded graph traversal
//! - **Run-state store**: append-only attempt records with recovery and
//!   retention
//!
//! ## Example
//!
//! ```no_run
//! use dpo_core::{Action, Driver, DriverConfig, InstanceRegistry};
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<InstanceRegistry>, actions: Vec<Arc<Action>>) {
//! let config = DriverConfig::new("my-app", "ingest-.*");
//! let driver = Driver::new(config, registry, actions);
//! let outcome = driver.run().await;
//! std::process::exit(outcome.exit_code);
//! # }
//! ```

pub mod action;
pub mod config;
pub mod connection;
pub mod context;
pub mod dag;
pub mod dataobject;
pub mod driver;
pub mod error;
pub mod execmode;
pub mod expression;
pub mod frame;
pub mod id;
pub mod metrics;
pub mod partition;
pub mod registry;
pub mod secret;
pub mod state;
pub mod subfeed;
pub mod transform;

pub use action::{Action, ActionMetadata, ActionOutcome};
pub use config::{
    ActionSpec, ConnectionSpec, DataObjectSpec, GlobalConfig, JsonTableSpec,
    LocalFsConnectionSpec, MemStreamSpec, MemTableSpec, PipelineConfig, TransformerSpec,
};
pub use connection::{Connection, ConnectionPool, PooledSession, SessionFactory};
pub use context::{ExecutionPhase, RunContext};
pub use dag::{ActionDag, DagScheduler, SchedulerConfig};
pub use dataobject::{
    CanHandlePartitions, CanMerge, CanRead, CanReadStream, CanWrite, DataObject, SaveMode,
    Transactional, WriteMetrics,
};
pub use driver::{Driver, DriverConfig, RunOutcome, TestMode};
pub use error::{DpoError, Result};
pub use execmode::{
    CustomPartitionMode, ExecutionMode, ModeInput, ModeResult, PartitionDiffMode,
};
pub use frame::{DataFrame, Record};
pub use id::{ActionId, ConnectionId, DataObjectId};
pub use metrics::MetricsCollector;
pub use partition::PartitionValues;
pub use registry::{CustomTransformer, InstanceRegistry};
pub use secret::{SecretProvider, SecretRegistry};
pub use state::{
    plan_recovery, ActionRunInfo, ActionState, RecoveryPlan, RetentionConfig, RunState,
    StateFileRef, StateStore,
};
pub use subfeed::SubFeed;
pub use transform::{TransformerChain, TransformerContext, TransformerLink};
