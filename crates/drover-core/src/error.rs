//! Typed error taxonomy for one orchestration cycle.
//!
//! Every variant is caught and recorded against the task or runner it
//! concerns; none of them aborts a cycle. Storage failures travel as
//! `anyhow::Error` and are the only fatal ones.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use drover_db::models::FailureKind;

/// Per-task and per-source failures surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A source adapter failed, panicked or timed out. The source is skipped.
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    /// A classifier stage could not run. The chain falls through.
    #[error("classification stage {stage} unavailable: {reason}")]
    ClassificationUnavailable { stage: String, reason: String },

    /// No eligible idle runner. The task stays queued.
    #[error("no runner available for task {task_id} (requires {required})")]
    AssignmentTimeout { task_id: Uuid, required: String },

    /// A proposed mutation was rejected; nothing was written.
    #[error("validation failed for task {task_id}: {source}")]
    ValidationFailure {
        task_id: Uuid,
        #[source]
        source: ValidationError,
    },

    /// The agent ran and reported failure.
    #[error("execution failed for task {task_id}: {message}")]
    ExecutionError { task_id: Uuid, message: String },

    /// The runner itself broke. The task is requeued.
    #[error("runner {runner_id} faulted on task {task_id}: {message}")]
    RunnerFault {
        task_id: Uuid,
        runner_id: String,
        message: String,
    },

    /// The run was cancelled while the task was executing.
    #[error("task {task_id} cancelled")]
    Cancelled { task_id: Uuid },
}

impl OrchestrationError {
    /// The failure category persisted on the task, for the variants that
    /// end an execution attempt.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::ValidationFailure { .. } => Some(FailureKind::ValidationFailure),
            Self::ExecutionError { .. } => Some(FailureKind::ExecutionError),
            Self::RunnerFault { .. } => Some(FailureKind::RunnerFault),
            Self::Cancelled { .. } => Some(FailureKind::Cancelled),
            Self::SourceUnavailable { .. }
            | Self::ClassificationUnavailable { .. }
            | Self::AssignmentTimeout { .. } => None,
        }
    }
}

/// Failures reported by an [`crate::agent::Agent`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent ran but could not do the work.
    #[error("agent failed: {0}")]
    Failed(String),

    /// The execution environment broke (spawn failure, lost process).
    #[error("runner fault: {0}")]
    RunnerFault(String),

    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The agent exceeded its wall-clock limit.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Reasons a proposed file mutation is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{format} content is malformed: {detail}")]
    Malformed { format: String, detail: String },

    #[error("content matches deny-listed pattern {pattern:?}")]
    DenyListed { pattern: String },

    #[error("target {path} escapes the workspace root")]
    OutsideWorkspace { path: String },

    #[error("target {path} is inside the protected directory {protected}")]
    Protected { path: String, protected: String },

    #[error("target path is empty")]
    EmptyPath,
}
