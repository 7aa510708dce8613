//! Testing utilities for the ATL workspace
//!
//! Scripted collaborators, canned sandbox results and fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use atl_core::{
    CreateTask, ExecutorError, ExternalRef, FileMap, InMemoryTaskStore, Orchestrator,
    PipelineConfig, PublishError, PublishRequest, PublishService, PublishTarget, RepoContext,
    ReviewVerdict, SpecArtifact, StageArtifact, StageContext, StageExecutor, StageKind, StoreError,
    Subtask, TaskId, TaskRecord, TaskStore,
};
use atl_sandbox::{
    CapturedOutput, KillReason, SandboxError, SandboxRequest, SandboxResult, SandboxRunner,
    TestSummary,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const REMOTE_URL: &str = "https://github.com/acme/widgets.git";

pub fn sample_code() -> FileMap {
    let mut files = FileMap::new();
    files.insert(
        "words.py".to_string(),
        "def reverse_words(s):\n    return ' '.join(w[::-1] for w in s.split(' '))\n".to_string(),
    );
    files
}

pub fn sample_tests() -> FileMap {
    let mut files = FileMap::new();
    files.insert(
        "test_words.py".to_string(),
        "from words import reverse_words\n\ndef test_reverse():\n    assert reverse_words('ab cd') == 'ba dc'\n"
            .to_string(),
    );
    files
}

pub fn sample_spec() -> SpecArtifact {
    SpecArtifact::new("Reverse each word of a sentence, keeping word order.")
        .with_subtask(Subtask::new("reverse_words", "Implement reverse_words(s)"))
        .with_criterion("Words keep their order")
}

/// One call observed by [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    pub stage: StageKind,
    pub iteration: u32,
    pub revision_feedback: Option<String>,
    pub retrieved: usize,
    pub saw_sandbox_result: bool,
}

/// Stage executor returning canned artifacts and scripted review verdicts
///
/// Review verdicts are consumed in order; once exhausted, every review
/// approves.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    reviews: Mutex<VecDeque<ReviewVerdict>>,
    always_revise: bool,
    fail_stage: Option<StageKind>,
    wrong_artifact: Option<StageKind>,
    delay: Option<(StageKind, Duration)>,
    empty_code: bool,
    calls: Mutex<Vec<StageCall>>,
}

impl ScriptedExecutor {
    pub fn approving() -> Self {
        Self::default()
    }

    pub fn with_reviews(reviews: impl IntoIterator<Item = ReviewVerdict>) -> Self {
        Self {
            reviews: Mutex::new(reviews.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn always_revising() -> Self {
        Self {
            always_revise: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing_at(mut self, stage: StageKind) -> Self {
        self.fail_stage = Some(stage);
        self
    }

    #[must_use]
    pub fn wrong_artifact_at(mut self, stage: StageKind) -> Self {
        self.wrong_artifact = Some(stage);
        self
    }

    #[must_use]
    pub fn slow_at(mut self, stage: StageKind, delay: Duration) -> Self {
        self.delay = Some((stage, delay));
        self
    }

    #[must_use]
    pub fn without_code(mut self) -> Self {
        self.empty_code = true;
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, stage: StageKind) -> Vec<StageCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    fn next_review(&self) -> ReviewVerdict {
        if self.always_revise {
            return ReviewVerdict::revise("Needs another pass")
                .with_issue("edge cases unhandled")
                .with_suggestion("cover empty input");
        }
        self.reviews
            .lock()
            .pop_front()
            .unwrap_or_else(|| ReviewVerdict::approve("Looks good"))
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn run(
        &self,
        stage: StageKind,
        context: StageContext,
    ) -> Result<StageArtifact, ExecutorError> {
        self.calls.lock().push(StageCall {
            stage,
            iteration: context.iteration,
            revision_feedback: context.revision_feedback.clone(),
            retrieved: context.retrieved.len(),
            saw_sandbox_result: context.sandbox_result.is_some(),
        });
        if let Some((slow, delay)) = self.delay {
            if slow == stage {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_stage == Some(stage) {
            return Err(ExecutorError::failed(format!("{stage} generator crashed")));
        }
        if self.wrong_artifact == Some(stage) {
            return Ok(StageArtifact::Review(ReviewVerdict::approve("out of place")));
        }
        Ok(match stage {
            StageKind::Spec => StageArtifact::Spec(sample_spec()),
            StageKind::Implement if self.empty_code => StageArtifact::Code(FileMap::new()),
            StageKind::Implement => StageArtifact::Code(sample_code()),
            StageKind::Test => StageArtifact::Tests(sample_tests()),
            StageKind::Review => StageArtifact::Review(self.next_review()),
            StageKind::Sandbox => {
                return Err(ExecutorError::failed("sandbox stage is not generated"));
            }
        })
    }
}

pub fn sandbox_result(exit: Option<i32>, kill: Option<KillReason>, tests: Option<TestSummary>) -> SandboxResult {
    SandboxResult {
        exit_status: exit,
        stdout: CapturedOutput::from_bytes(b"collected 1 item\n", 17),
        stderr: CapturedOutput::default(),
        wall_time: Duration::from_millis(120),
        was_killed: kill.is_some(),
        kill_reason: kill,
        tests,
        backend: "stub".to_string(),
    }
}

pub fn passing_result() -> SandboxResult {
    sandbox_result(
        Some(0),
        None,
        Some(TestSummary {
            passed: 1,
            ..TestSummary::default()
        }),
    )
}

pub fn failing_result() -> SandboxResult {
    sandbox_result(
        Some(1),
        None,
        Some(TestSummary {
            passed: 2,
            failed: 1,
            ..TestSummary::default()
        }),
    )
}

pub fn killed_result() -> SandboxResult {
    sandbox_result(None, Some(KillReason::Timeout), None)
}

/// Sandbox runner returning a fixed outcome
#[derive(Debug)]
pub struct StubSandbox {
    outcome: Result<SandboxResult, SandboxError>,
    delay: Option<Duration>,
    runs: AtomicUsize,
    last_request: Mutex<Option<SandboxRequest>>,
}

impl StubSandbox {
    pub fn returning(result: SandboxResult) -> Self {
        Self {
            outcome: Ok(result),
            delay: None,
            runs: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn passing() -> Self {
        Self::returning(passing_result())
    }

    pub fn erroring(error: SandboxError) -> Self {
        Self {
            outcome: Err(error),
            ..Self::passing()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SandboxRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl SandboxRunner for StubSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

/// Publisher recording every request
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(PublishRequest, PublishTarget)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(PublishRequest, PublishTarget)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl PublishService for RecordingPublisher {
    async fn publish(
        &self,
        request: PublishRequest,
        target: &PublishTarget,
    ) -> Result<ExternalRef, PublishError> {
        let mut published = self.published.lock();
        published.push((request, target.clone()));
        Ok(ExternalRef {
            url: format!(
                "https://github.com/{}/{}/pull/{}",
                target.owner,
                target.repo,
                published.len()
            ),
            branch: Some(format!("atl/{}", published.len())),
        })
    }
}

/// Publisher that always fails
#[derive(Debug, Default)]
pub struct FailingPublisher;

#[async_trait]
impl PublishService for FailingPublisher {
    async fn publish(
        &self,
        _request: PublishRequest,
        _target: &PublishTarget,
    ) -> Result<ExternalRef, PublishError> {
        Err(PublishError::Rejected("branch protection".to_string()))
    }
}

/// In-memory store whose saves can be made to fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryTaskStore,
    // (saves still allowed to succeed, saves to fail after those)
    plan: Mutex<(usize, usize)>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` saves with an I/O error
    pub fn fail_next_saves(&self, count: usize) {
        self.fail_saves(0, count);
    }

    /// Let `after` saves through, then fail the `count` after them
    pub fn fail_saves(&self, after: usize, count: usize) {
        *self.plan.lock() = (after, count);
    }

    fn save_fails(&self) -> bool {
        let mut plan = self.plan.lock();
        match *plan {
            (_, 0) => false,
            (0, failing) => {
                *plan = (0, failing - 1);
                true
            }
            (after, failing) => {
                *plan = (after - 1, failing);
                false
            }
        }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        if self.save_fails() {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(record).await
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list().await
    }
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig::new().with_stage_timeout_secs(5)
}

pub fn orchestrator(executor: Arc<ScriptedExecutor>, sandbox: Arc<StubSandbox>) -> Orchestrator {
    Orchestrator::builder(executor, sandbox)
        .config(fast_config())
        .build()
        .unwrap()
}

pub fn publishing_orchestrator(
    executor: Arc<ScriptedExecutor>,
    sandbox: Arc<StubSandbox>,
    publisher: Arc<dyn PublishService>,
) -> Orchestrator {
    Orchestrator::builder(executor, sandbox)
        .config(fast_config())
        .publisher(publisher)
        .build()
        .unwrap()
}

pub async fn create(orchestrator: &Orchestrator, id: &str) -> TaskId {
    orchestrator
        .create_task(
            CreateTask::new("Reverse every word in a sentence")
                .with_id(id)
                .with_repo(RepoContext::remote(REMOTE_URL)),
        )
        .await
        .unwrap()
}
