//! Pipeline transition table
//!
//! Forward-only except the single revision edge
//! `review_processing -> dev_processing`, which the orchestrator bounds with
//! the iteration counter. Every processing stage may fail; a human decision
//! is the only way out of `awaiting_approval`.

use crate::error::OrchestratorError;
use crate::types::TaskStatus;

/// Statuses reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[PmProcessing, Failed],
        PmProcessing => &[DevProcessing, Failed],
        DevProcessing => &[QaProcessing, Failed],
        QaProcessing => &[SandboxRunning, Failed],
        SandboxRunning => &[ReviewProcessing, Failed],
        ReviewProcessing => &[AwaitingApproval, DevProcessing, Failed],
        AwaitingApproval => &[Approved, Rejected],
        Approved => &[Completed, Failed],
        Rejected | Completed | Failed => &[],
    }
}

/// Validate a single transition
///
/// # Errors
/// `IllegalTransition` when `to` is not reachable from `from`
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), OrchestratorError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(OrchestratorError::IllegalTransition { from, to })
    }
}

/// Check whether a transition is the revision loop edge
#[inline]
#[must_use]
pub fn is_revision(from: TaskStatus, to: TaskStatus) -> bool {
    from == TaskStatus::ReviewProcessing && to == TaskStatus::DevProcessing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            TaskStatus::Pending,
            TaskStatus::PmProcessing,
            TaskStatus::DevProcessing,
            TaskStatus::QaProcessing,
            TaskStatus::SandboxRunning,
            TaskStatus::ReviewProcessing,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
            TaskStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in TaskStatus::ALL.into_iter().filter(TaskStatus::is_terminal) {
            assert!(allowed_transitions(status).is_empty());
        }
    }

    #[test]
    fn awaiting_approval_cannot_fail_directly() {
        assert!(validate_transition(TaskStatus::AwaitingApproval, TaskStatus::Failed).is_err());
        assert!(validate_transition(TaskStatus::Pending, TaskStatus::AwaitingApproval).is_err());
    }

    #[test]
    fn only_review_loops_back() {
        assert!(is_revision(TaskStatus::ReviewProcessing, TaskStatus::DevProcessing));
        assert!(validate_transition(TaskStatus::SandboxRunning, TaskStatus::DevProcessing).is_err());
    }
}
