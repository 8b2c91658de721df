//! Error taxonomy of the orchestrator.
//!
//! Soft errors (`NoDataDontStop`, `NoDataStop`) are caught at action
//! boundaries and converted into subfeed annotations. Hard errors bubble up
//! to the scheduler, which marks the offending action failed, cancels its
//! descendants and persists the final run state.

use crate::id::ActionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DpoError>;

#[derive(Debug, Error)]
pub enum DpoError {
    /// Invalid pipeline description, detected before any write.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend is unreachable or does not look like its description.
    #[error("precondition failed for {id}: {message}")]
    Precondition { id: String, message: String },

    /// The action has nothing to process; downstream actions may skip.
    #[error("no data to process for {action_id}")]
    NoDataDontStop { action_id: ActionId },

    /// The run ends early but successfully.
    #[error("no data to process, stopping the run")]
    NoDataStop,

    /// An engine or transformation failure during execution.
    #[error("action {action_id} failed: {source}")]
    TaskFailed {
        action_id: ActionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("action {action_id} timed out after {timeout_sec}s")]
    Timeout { action_id: ActionId, timeout_sec: u64 },

    /// The action was never run because the run was already failed.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DpoError {
    pub fn config(message: impl Into<String>) -> Self {
        DpoError::Config(message.into())
    }

    pub fn precondition(id: impl ToString, message: impl Into<String>) -> Self {
        DpoError::Precondition {
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub fn task(action_id: ActionId, source: impl Into<anyhow::Error>) -> Self {
        DpoError::TaskFailed {
            action_id,
            source: source.into(),
        }
    }

    /// Soft errors are recovered at the action or run boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DpoError::NoDataDontStop { .. } | DpoError::NoDataStop)
    }

    /// Short classification recorded in state files.
    pub fn kind(&self) -> &'static str {
        match self {
            DpoError::Config(_) => "CONFIGURATION",
            DpoError::Precondition { .. } => "PRECONDITION",
            DpoError::NoDataDontStop { .. } => "NO_DATA_DONT_STOP",
            DpoError::NoDataStop => "NO_DATA_STOP",
            DpoError::TaskFailed { .. } => "TASK_FAILED",
            DpoError::Timeout { .. } => "TIMEOUT",
            DpoError::Cancelled => "CANCELLED",
            DpoError::Other(_) => "TASK_FAILED",
        }
    }

    /// Process exit code surfaced by the driver for a run ending in this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DpoError::Config(_) | DpoError::Precondition { .. } => 1,
            DpoError::NoDataDontStop { .. } | DpoError::NoDataStop => 0,
            _ => 2,
        }
    }
}
