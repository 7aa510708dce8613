//! Error types for ATL Core
//!
//! Provides error handling for:
//! - Stage executor and collaborator failures
//! - Command rejection (invalid state, unknown task)
//! - Task store persistence
//! - Configuration loading
//!
//! Only command rejections surface synchronously. Everything that happens
//! while driving a task is recorded on the task and published as an event.

use crate::types::{TaskId, TaskStatus};
use atl_sandbox::SandboxError;

/// Orchestrator command error
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Command not valid in the task's current state
    #[error("task {task_id} is {status}; cannot {command}")]
    InvalidState {
        /// Task the command targeted
        task_id: TaskId,
        /// Status at the time of the command
        status: TaskStatus,
        /// Rejected command name
        command: &'static str,
    },

    /// Unknown task id
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A task with this id already exists
    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    /// Malformed command input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transition not allowed by the state machine
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Source status
        from: TaskStatus,
        /// Target status
        to: TaskStatus,
    },

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Create invalid state error
    #[inline]
    pub fn invalid_state(task_id: TaskId, status: TaskStatus, command: &'static str) -> Self {
        Self::InvalidState {
            task_id,
            status,
            command,
        }
    }

    /// Check if the command was rejected without touching the task
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::TaskNotFound(_)
                | Self::DuplicateTask(_)
                | Self::InvalidRequest(_)
        )
    }
}

/// Stage executor error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Executor reported a failure
    #[error("executor failed: {0}")]
    Failed(String),

    /// Stage call exceeded its timeout
    #[error("stage timed out after {secs}s")]
    Timeout {
        /// Configured timeout
        secs: u64,
    },

    /// Executor returned an artifact for a different stage
    #[error("expected {expected} artifact, got {actual}")]
    UnexpectedArtifact {
        /// Stage that was requested
        expected: &'static str,
        /// Artifact that came back
        actual: &'static str,
    },

    /// Worker pool shut down
    #[error("worker pool closed")]
    PoolClosed,
}

impl ExecutorError {
    /// Create failed error
    #[inline]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Publishing error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Remote rejected the publication
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// Publication exceeded its timeout
    #[error("publish timed out after {secs}s")]
    Timeout {
        /// Configured timeout
        secs: u64,
    },

    /// Worker pool shut down
    #[error("worker pool closed")]
    PoolClosed,
}

/// Retrieval service error (never fatal to a task)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retrieval failed: {0}")]
pub struct RetrievalError(pub String);

/// Task store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert of an id that already exists
    #[error("duplicate task id: {0}")]
    Duplicate(TaskId),
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for the schema
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reason a task was driven to `failed`
///
/// Never returned from commands; converted into the task's error message.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StageFailure {
    #[error("{0}")]
    Executor(#[from] ExecutorError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Publish(#[from] PublishError),

    #[error("{0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = OrchestratorError::invalid_state(
            TaskId::parse("t-1").unwrap(),
            TaskStatus::DevProcessing,
            "approve",
        );
        assert_eq!(err.to_string(), "task t-1 is dev_processing; cannot approve");
        assert!(err.is_rejection());
    }

    #[test]
    fn store_errors_are_not_rejections() {
        let err = OrchestratorError::from(StoreError::Duplicate(TaskId::parse("x").unwrap()));
        assert!(!err.is_rejection());
    }

    #[test]
    fn stage_failure_keeps_source_message() {
        let failure = StageFailure::from(ExecutorError::Timeout { secs: 5 });
        assert_eq!(failure.to_string(), "stage timed out after 5s");
        let failure = StageFailure::from(SandboxError::unavailable("no docker"));
        assert_eq!(failure.to_string(), "sandbox unavailable: no docker");
    }
}
