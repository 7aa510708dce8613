//! Task record
//!
//! The durable entity for one pipeline run. Snapshots handed to callers are
//! clones; the live record is only mutated by the orchestrator through the
//! crate-private methods below, which enforce:
//! - transitions follow the state machine
//! - terminal records never change
//! - messages are append-only with strictly increasing timestamps

use crate::error::OrchestratorError;
use crate::state_machine::validate_transition;
use crate::types::{
    Agent, AgentMessage, FileMap, RepoContext, ReviewVerdict, SpecArtifact, TaskId, TaskStatus,
};
use atl_sandbox::SandboxResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id
    pub id: TaskId,
    /// Natural-language change request
    pub description: String,
    /// Pipeline status
    pub status: TaskStatus,
    /// Completed revision loops
    pub iteration_count: u32,
    /// Revision budget fixed at creation
    pub max_iterations: u32,
    /// Sandbox verdict (`None` until a run has been judged)
    pub is_tests_passing: Option<bool>,
    /// Human verdict (`None` until approved or rejected)
    pub is_approved: Option<bool>,
    /// External reference produced by publishing
    pub pr_reference: Option<String>,
    /// Why the task failed or was rejected
    pub error_message: Option<String>,
    /// Implementation files
    pub code_files: FileMap,
    /// Test files
    pub test_files: FileMap,
    /// Specification
    pub spec: Option<SpecArtifact>,
    /// Latest sandbox run
    pub sandbox_report: Option<SandboxResult>,
    /// Latest review verdict
    pub review: Option<ReviewVerdict>,
    /// Target repository
    pub repo: Option<RepoContext>,
    /// Ordered message history
    pub messages: Vec<AgentMessage>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a pending record
    pub(crate) fn new(
        id: TaskId,
        description: impl Into<String>,
        repo: Option<RepoContext>,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            description: description.into(),
            status: TaskStatus::Pending,
            iteration_count: 0,
            max_iterations,
            is_tests_passing: None,
            is_approved: None,
            pr_reference: None,
            error_message: None,
            code_files: FileMap::new(),
            test_files: FileMap::new(),
            spec: None,
            sandbox_report: None,
            review: None,
            repo,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the record can no longer change
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check whether another revision loop fits in the budget
    #[inline]
    #[must_use]
    pub fn can_revise(&self) -> bool {
        self.iteration_count < self.max_iterations
    }

    /// Most recent message
    #[must_use]
    pub fn last_message(&self) -> Option<&AgentMessage> {
        self.messages.last()
    }

    /// Move to `to`, returning the previous status
    pub(crate) fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, OrchestratorError> {
        validate_transition(self.status, to)?;
        let from = std::mem::replace(&mut self.status, to);
        self.touch();
        Ok(from)
    }

    /// Append a message, keeping timestamps strictly increasing
    pub(crate) fn append_message(&mut self, agent: Agent, content: impl Into<String>) -> AgentMessage {
        debug_assert!(!self.is_terminal(), "message appended to terminal task");
        let mut timestamp = Utc::now();
        if let Some(last) = self.messages.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }
        let message = AgentMessage {
            agent,
            content: content.into(),
            timestamp,
        };
        self.messages.push(message.clone());
        self.touch();
        message
    }

    /// Start another implementation attempt
    ///
    /// Spec and history survive; the previous run's evidence does not.
    pub(crate) fn begin_revision(&mut self) {
        self.iteration_count += 1;
        self.sandbox_report = None;
        self.review = None;
        self.is_tests_passing = None;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at { now } else { self.updated_at };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(TaskId::parse("rec-1").unwrap(), "add a function", None, 3)
    }

    #[test]
    fn new_record_is_pending_and_unknown() {
        let r = record();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.iteration_count, 0);
        assert_eq!(r.is_tests_passing, None);
        assert_eq!(r.is_approved, None);
        assert!(r.messages.is_empty());
    }

    #[test]
    fn message_timestamps_strictly_increase() {
        let mut r = record();
        for i in 0..200 {
            r.append_message(Agent::System, format!("m{i}"));
        }
        for pair in r.messages.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn transition_enforces_table() {
        let mut r = record();
        assert_eq!(r.transition(TaskStatus::PmProcessing).unwrap(), TaskStatus::Pending);
        assert!(r.transition(TaskStatus::Completed).is_err());
        assert_eq!(r.status, TaskStatus::PmProcessing);
    }

    #[test]
    fn terminal_record_rejects_transitions() {
        let mut r = record();
        r.transition(TaskStatus::Failed).unwrap();
        for to in TaskStatus::ALL {
            assert!(r.transition(to).is_err());
        }
        assert_eq!(r.status, TaskStatus::Failed);
    }

    #[test]
    fn revision_discards_run_evidence_only() {
        let mut r = record();
        r.spec = Some(SpecArtifact::new("spec"));
        r.review = Some(ReviewVerdict::revise("again"));
        r.is_tests_passing = Some(false);
        r.append_message(Agent::Reviewer, "again");

        r.begin_revision();

        assert_eq!(r.iteration_count, 1);
        assert!(r.review.is_none());
        assert!(r.is_tests_passing.is_none());
        assert!(r.spec.is_some());
        assert_eq!(r.messages.len(), 1);
    }
}
