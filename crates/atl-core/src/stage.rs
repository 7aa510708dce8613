//! Stages and external collaborators
//!
//! The pipeline has a closed set of stages. Content-producing stages are
//! dispatched to one [`StageExecutor`]; the sandbox stage goes to the
//! sandbox engine. Retrieval and publishing are separate seams so they can
//! be swapped or faked independently.

use crate::error::{ExecutorError, PublishError, RetrievalError};
use crate::record::TaskRecord;
use crate::types::{
    Agent, AgentMessage, FileMap, PublishTarget, RepoContext, ReviewVerdict, SpecArtifact, TaskId,
    TaskStatus,
};
use atl_sandbox::SandboxResult;
use serde::{Deserialize, Serialize};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Write the specification
    Spec,
    /// Write or revise the implementation
    Implement,
    /// Write tests
    Test,
    /// Execute tests in the sandbox
    Sandbox,
    /// Judge the result
    Review,
}

impl StageKind {
    /// Stage run while the task has `status`
    #[must_use]
    pub fn for_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::PmProcessing => Some(Self::Spec),
            TaskStatus::DevProcessing => Some(Self::Implement),
            TaskStatus::QaProcessing => Some(Self::Test),
            TaskStatus::SandboxRunning => Some(Self::Sandbox),
            TaskStatus::ReviewProcessing => Some(Self::Review),
            _ => None,
        }
    }

    /// Agent credited with the stage's messages
    #[must_use]
    pub fn agent(&self) -> Agent {
        match self {
            Self::Spec => Agent::Pm,
            Self::Implement => Agent::Dev,
            Self::Test => Agent::Qa,
            Self::Sandbox => Agent::Sandbox,
            Self::Review => Agent::Reviewer,
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Sandbox => "sandbox",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked snippet from semantic code retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    /// Source path
    pub path: String,
    /// Snippet text
    pub content: String,
    /// Relevance (higher is better)
    pub score: f32,
}

/// Read-only view of a task handed to a stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    /// Task id
    pub task_id: TaskId,
    /// Change request
    pub description: String,
    /// Completed revision loops
    pub iteration: u32,
    /// Specification, once written
    pub spec: Option<SpecArtifact>,
    /// Current implementation
    pub code_files: FileMap,
    /// Current tests
    pub test_files: FileMap,
    /// Message history
    pub messages: Vec<AgentMessage>,
    /// Retrieved code (implement stage only)
    pub retrieved: Vec<Snippet>,
    /// Latest sandbox run (review stage)
    pub sandbox_result: Option<SandboxResult>,
    /// Reviewer feedback that triggered this revision
    pub revision_feedback: Option<String>,
    /// Target repository
    pub repo: Option<RepoContext>,
}

impl StageContext {
    /// Build context from a task snapshot
    #[must_use]
    pub fn from_record(record: &TaskRecord) -> Self {
        let revision_feedback = (record.iteration_count > 0)
            .then(|| {
                record
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.agent == Agent::Reviewer)
                    .map(|m| m.content.clone())
            })
            .flatten();
        Self {
            task_id: record.id.clone(),
            description: record.description.clone(),
            iteration: record.iteration_count,
            spec: record.spec.clone(),
            code_files: record.code_files.clone(),
            test_files: record.test_files.clone(),
            messages: record.messages.clone(),
            retrieved: Vec::new(),
            sandbox_result: record.sandbox_report.clone(),
            revision_feedback,
            repo: record.repo.clone(),
        }
    }

    /// Sandbox evidence as text, when a run happened
    #[must_use]
    pub fn sandbox_evidence(&self) -> Option<String> {
        self.sandbox_result.as_ref().map(SandboxResult::evidence)
    }
}

/// Output of a content-producing stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageArtifact {
    /// Specification
    Spec(SpecArtifact),
    /// Complete implementation (replaces previous files)
    Code(FileMap),
    /// Complete test suite (replaces previous files)
    Tests(FileMap),
    /// Review verdict
    Review(ReviewVerdict),
}

impl StageArtifact {
    /// Artifact name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Spec(_) => "spec",
            Self::Code(_) => "code",
            Self::Tests(_) => "tests",
            Self::Review(_) => "review",
        }
    }
}

/// Content generation for the spec, implement, test and review stages
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    /// Produce the artifact for `stage`
    async fn run(
        &self,
        stage: StageKind,
        context: StageContext,
    ) -> Result<StageArtifact, ExecutorError>;
}

/// Semantic code search
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RetrievalService: Send + Sync {
    /// Ranked snippets relevant to `text`
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Snippet>, RetrievalError>;
}

/// Reference returned by a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    /// URL of the published change
    pub url: String,
    /// Branch the change was pushed to
    pub branch: Option<String>,
}

impl std::fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Change to publish for review upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Originating task
    pub task_id: TaskId,
    /// Title (`[AI] ` + start of the description)
    pub title: String,
    /// Markdown body
    pub body: String,
    /// Implementation files
    pub code_files: FileMap,
    /// Test files
    pub test_files: FileMap,
}

const TITLE_CHARS: usize = 50;
const SPEC_CHARS: usize = 2000;
const RESULTS_CHARS: usize = 1000;
const REVIEW_CHARS: usize = 500;

fn clip(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(idx, _)| &text[..idx])
}

impl PublishRequest {
    /// Build from an approved task
    #[must_use]
    pub fn from_record(record: &TaskRecord) -> Self {
        use std::fmt::Write as _;

        let spec = record.spec.as_ref().map_or("N/A", |s| s.text.as_str());
        let results = record
            .sandbox_report
            .as_ref()
            .map_or_else(|| "N/A".to_string(), SandboxResult::evidence);
        let review = record
            .review
            .as_ref()
            .map_or_else(|| "Approved by reviewer.".to_string(), ReviewVerdict::feedback);

        let mut body = format!(
            "## Automated change\n\n### Task Description\n{}\n\n### Technical Specification\n{}\n\n### Files Changed\n",
            record.description,
            clip(spec, SPEC_CHARS)
        );
        for path in record.code_files.keys() {
            let _ = writeln!(body, "- `{path}`");
        }
        body.push_str("\n### Test Files\n");
        for path in record.test_files.keys() {
            let _ = writeln!(body, "- `{path}`");
        }
        let _ = write!(
            body,
            "\n### Test Results\n```\n{}\n```\n\n### Review Notes\n{}\n",
            clip(&results, RESULTS_CHARS),
            clip(&review, REVIEW_CHARS)
        );

        Self {
            task_id: record.id.clone(),
            title: format!("[AI] {}", clip(&record.description, TITLE_CHARS)),
            body,
            code_files: record.code_files.clone(),
            test_files: record.test_files.clone(),
        }
    }
}

/// Version-control publishing
#[async_trait::async_trait]
pub trait PublishService: Send + Sync {
    /// Publish the change to `target`
    async fn publish(
        &self,
        request: PublishRequest,
        target: &PublishTarget,
    ) -> Result<ExternalRef, PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::parse("stage-1").unwrap(),
            "Implement a function that reverses every word in a sentence while keeping order",
            None,
            3,
        )
    }

    #[test]
    fn stages_map_to_processing_statuses() {
        assert_eq!(StageKind::for_status(TaskStatus::PmProcessing), Some(StageKind::Spec));
        assert_eq!(StageKind::for_status(TaskStatus::SandboxRunning), Some(StageKind::Sandbox));
        assert_eq!(StageKind::for_status(TaskStatus::AwaitingApproval), None);
        assert_eq!(StageKind::Review.agent(), Agent::Reviewer);
    }

    #[test]
    fn revision_feedback_comes_from_latest_review_message() {
        let mut r = record();
        r.append_message(Agent::Reviewer, "first pass");
        assert_eq!(StageContext::from_record(&r).revision_feedback, None);

        r.append_message(Agent::Reviewer, "handle punctuation");
        r.begin_revision();
        let ctx = StageContext::from_record(&r);
        assert_eq!(ctx.revision_feedback.as_deref(), Some("handle punctuation"));
        assert_eq!(ctx.iteration, 1);
    }

    #[test]
    fn publish_request_title_and_body() {
        let mut r = record();
        r.code_files.insert("words.py".into(), "def rev(s): ...".into());
        r.test_files.insert("test_words.py".into(), "def test(): ...".into());
        r.spec = Some(SpecArtifact::new("Reverse each word."));
        let req = PublishRequest::from_record(&r);

        assert_eq!(
            req.title,
            "[AI] Implement a function that reverses every word in a"
        );
        assert!(req.body.contains("- `words.py`"));
        assert!(req.body.contains("- `test_words.py`"));
        assert!(req.body.contains("Reverse each word."));
        assert!(req.body.contains("Approved by reviewer."));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé");
        assert_eq!(clip("hi", 10), "hi");
    }

    #[tokio::test]
    async fn retrieval_seam_is_mockable() {
        let mut mock = MockRetrievalService::new();
        mock.expect_query().returning(|_, limit| {
            Ok(vec![
                Snippet {
                    path: "src/lib.rs".into(),
                    content: "fn main() {}".into(),
                    score: 0.9,
                };
                limit
            ])
        });
        let snippets = mock.query("reverse words", 2).await.unwrap();
        assert_eq!(snippets.len(), 2);
    }
}
