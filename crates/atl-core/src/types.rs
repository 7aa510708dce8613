//! Core types for ATL pipelines
//!
//! Defines:
//! - Task identity and status
//! - Agent messages
//! - Stage artifacts carried on the task (spec, review verdict)
//! - Repository context and publish target

use crate::error::OrchestratorError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

pub use atl_sandbox::FileMap;

/// Unique task identifier
///
/// Generated ids are ULIDs; caller-supplied ids must be 1-64 characters of
/// `[A-Za-z0-9_-]` so they are safe as file names and log fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Validate a caller-supplied id
    ///
    /// # Errors
    /// `InvalidRequest` when the id is empty, too long, or has unsafe characters
    pub fn parse(raw: &str) -> Result<Self, OrchestratorError> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(OrchestratorError::InvalidRequest(format!(
                "task id must be 1-64 characters of [A-Za-z0-9_-], got {raw:?}"
            )))
        }
    }

    /// Get the id as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Pipeline status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started
    Pending,
    /// Specification stage running
    PmProcessing,
    /// Implementation stage running
    DevProcessing,
    /// Test generation stage running
    QaProcessing,
    /// Sandbox validation running
    SandboxRunning,
    /// Review stage running
    ReviewProcessing,
    /// Waiting on a human decision
    AwaitingApproval,
    /// Approved, publishing
    Approved,
    /// Rejected by a human (terminal)
    Rejected,
    /// Published (terminal)
    Completed,
    /// Unrecoverable failure (terminal)
    Failed,
}

impl TaskStatus {
    /// All statuses in pipeline order
    pub const ALL: [Self; 11] = [
        Self::Pending,
        Self::PmProcessing,
        Self::DevProcessing,
        Self::QaProcessing,
        Self::SandboxRunning,
        Self::ReviewProcessing,
        Self::AwaitingApproval,
        Self::Approved,
        Self::Rejected,
        Self::Completed,
        Self::Failed,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PmProcessing => "pm_processing",
            Self::DevProcessing => "dev_processing",
            Self::QaProcessing => "qa_processing",
            Self::SandboxRunning => "sandbox_running",
            Self::ReviewProcessing => "review_processing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No further transitions or mutations
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// The orchestrator can advance this status without a human
    #[inline]
    #[must_use]
    pub fn is_drivable(&self) -> bool {
        !self.is_terminal() && *self != Self::AwaitingApproval
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a task message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    /// Specification author
    Pm,
    /// Implementer
    Dev,
    /// Test author
    Qa,
    /// Sandbox engine
    Sandbox,
    /// Reviewer
    Reviewer,
    /// The orchestrator itself
    System,
}

impl Agent {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Sandbox => "sandbox",
            Self::Reviewer => "reviewer",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only task message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Author
    pub agent: Agent,
    /// Message body
    pub content: String,
    /// Append time (strictly increasing within a task)
    pub timestamp: DateTime<Utc>,
}

/// One item of a specification's task breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Short title
    pub title: String,
    /// What needs doing
    pub detail: String,
}

impl Subtask {
    /// Create subtask
    #[inline]
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

/// Specification produced by the spec stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecArtifact {
    /// Prose specification
    pub text: String,
    /// Task breakdown
    pub breakdown: Vec<Subtask>,
    /// Acceptance criteria
    pub acceptance_criteria: Vec<String>,
}

impl SpecArtifact {
    /// Create spec with text only
    #[inline]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// With breakdown item
    #[must_use]
    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.breakdown.push(subtask);
        self
    }

    /// With acceptance criterion
    #[must_use]
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }
}

/// Review decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Ready for human approval
    Approve,
    /// Send back to implementation
    Revise,
    /// Abandon the task
    Fail,
}

/// Verdict returned by the review stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// Decision
    pub decision: ReviewDecision,
    /// One-paragraph summary
    pub summary: String,
    /// Problems found
    #[serde(default)]
    pub issues: Vec<String>,
    /// Suggested changes
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ReviewVerdict {
    /// Approving verdict
    pub fn approve(summary: impl Into<String>) -> Self {
        Self::with_decision(ReviewDecision::Approve, summary)
    }

    /// Revision request
    pub fn revise(summary: impl Into<String>) -> Self {
        Self::with_decision(ReviewDecision::Revise, summary)
    }

    /// Failing verdict
    pub fn fail(summary: impl Into<String>) -> Self {
        Self::with_decision(ReviewDecision::Fail, summary)
    }

    fn with_decision(decision: ReviewDecision, summary: impl Into<String>) -> Self {
        Self {
            decision,
            summary: summary.into(),
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// With issue
    #[must_use]
    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    /// With suggestion
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Feedback text for the next implementation attempt
    #[must_use]
    pub fn feedback(&self) -> String {
        let mut out = self.summary.clone();
        if !self.issues.is_empty() {
            out.push_str("\n\nIssues:");
            for issue in &self.issues {
                out.push_str("\n- ");
                out.push_str(issue);
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("\n\nSuggestions:");
            for suggestion in &self.suggestions {
                out.push_str("\n- ");
                out.push_str(suggestion);
            }
        }
        out
    }
}

/// Repository the change targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoContext {
    /// Local checkout
    pub local_path: Option<PathBuf>,
    /// Remote URL (HTTPS or SSH)
    pub remote_url: Option<String>,
}

impl RepoContext {
    /// Context for a remote repository
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            local_path: None,
            remote_url: Some(url.into()),
        }
    }

    /// With local checkout
    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Publish target derived from the remote URL
    #[must_use]
    pub fn publish_target(&self) -> Option<PublishTarget> {
        self.remote_url.as_deref().and_then(PublishTarget::parse)
    }
}

/// Owner/repository pair on the hosting service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishTarget {
    /// Account or organization
    pub owner: String,
    /// Repository name
    pub repo: String,
}

fn remote_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:https?://[^/]+/|ssh://git@[^/]+/|git@[^:]+:)([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$",
        )
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

impl PublishTarget {
    /// Parse `https://host/owner/repo(.git)` or `git@host:owner/repo(.git)`
    #[must_use]
    pub fn parse(url: &str) -> Option<Self> {
        let caps = remote_pattern().captures(url.trim())?;
        Some(Self {
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
        })
    }
}

impl std::fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_validation() {
        assert!(TaskId::parse("task-42_a").is_ok());
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("../etc").is_err());
        assert!(TaskId::parse(&"x".repeat(65)).is_err());
        assert_eq!(TaskId::generate().as_str().len(), 26);
    }

    #[test]
    fn status_wire_names() {
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn terminal_and_drivable() {
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::AwaitingApproval.is_terminal());
        assert!(!TaskStatus::AwaitingApproval.is_drivable());
        assert!(TaskStatus::Approved.is_drivable());
    }

    #[test]
    fn publish_target_from_remote_forms() {
        let https = PublishTarget::parse("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(https.to_string(), "acme/widgets");
        let ssh = PublishTarget::parse("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(ssh, https);
        let bare = PublishTarget::parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(bare.repo, "widgets");
        assert!(PublishTarget::parse("not a url").is_none());
        assert!(RepoContext::default().publish_target().is_none());
    }

    #[test]
    fn feedback_lists_issues_and_suggestions() {
        let verdict = ReviewVerdict::revise("Edge cases missing")
            .with_issue("empty input panics")
            .with_suggestion("return an error for empty input");
        let feedback = verdict.feedback();
        assert!(feedback.starts_with("Edge cases missing"));
        assert!(feedback.contains("Issues:\n- empty input panics"));
        assert!(feedback.contains("Suggestions:\n- return an error"));
    }
}
