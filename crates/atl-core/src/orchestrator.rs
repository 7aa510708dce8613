//! Pipeline orchestrator
//!
//! Drives task records through the stage pipeline:
//! - one transition per `advance`, persisted and published before returning
//! - a bounded revision loop between review and implementation
//! - a human checkpoint at `awaiting_approval`
//!
//! Each task has a single-owner lock. Advances queue on it; Approve/Reject
//! never wait: if an advance holds the lock they fail with `InvalidState`.
//! Reads go to the store and never touch the lock.

use crate::config::PipelineConfig;
use crate::error::{
    ConfigError, ExecutorError, OrchestratorError, PublishError, StageFailure, StoreError,
};
use crate::events::{ArtifactKind, EventBus, EventKind, Subscription};
use crate::record::TaskRecord;
use crate::stage::{
    PublishRequest, PublishService, RetrievalService, Snippet, StageArtifact, StageContext,
    StageExecutor, StageKind,
};
use crate::store::{InMemoryTaskStore, TaskStore};
use crate::types::{
    Agent, FileMap, RepoContext, ReviewDecision, ReviewVerdict, SpecArtifact, TaskId, TaskStatus,
};
use crate::worker_pool::{PoolError, PoolStats, WorkerPool};
use atl_sandbox::{SandboxRequest, SandboxRunner};
use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

const RETRIEVAL_LIMIT: usize = 5;
const AWAITING_APPROVAL_MESSAGE: &str = "Awaiting human approval before publishing.";

type TaskCell = Arc<Mutex<TaskRecord>>;

/// Input to [`Orchestrator::create_task`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTask {
    /// Natural-language change request
    pub description: String,
    /// Target repository
    pub repo: Option<RepoContext>,
    /// Caller-chosen id (generated when absent)
    pub external_id: Option<String>,
}

impl CreateTask {
    /// Create request
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            repo: None,
            external_id: None,
        }
    }

    /// With repository context
    #[must_use]
    pub fn with_repo(mut self, repo: RepoContext) -> Self {
        self.repo = Some(repo);
        self
    }

    /// With caller-chosen id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn TaskStore>>,
    executor: Arc<dyn StageExecutor>,
    sandbox: Arc<dyn SandboxRunner>,
    retrieval: Option<Arc<dyn RetrievalService>>,
    publisher: Option<Arc<dyn PublishService>>,
}

impl OrchestratorBuilder {
    /// With configuration
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// With task store (in-memory by default)
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// With retrieval service
    #[must_use]
    pub fn retrieval(mut self, retrieval: Arc<dyn RetrievalService>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// With publisher
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn PublishService>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Validate configuration and build
    ///
    /// # Errors
    /// `ConfigError::Invalid` for out-of-range configuration
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                bus: EventBus::new(self.config.event_capacity),
                workers: WorkerPool::new(self.config.max_concurrent_stages),
                tasks: DashMap::new(),
                config: self.config,
                store,
                executor: self.executor,
                sandbox: self.sandbox,
                retrieval: self.retrieval,
                publisher: self.publisher,
            }),
        })
    }
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn TaskStore>,
    bus: EventBus,
    tasks: DashMap<TaskId, TaskCell>,
    workers: WorkerPool,
    executor: Arc<dyn StageExecutor>,
    sandbox: Arc<dyn SandboxRunner>,
    retrieval: Option<Arc<dyn RetrievalService>>,
    publisher: Option<Arc<dyn PublishService>>,
}

/// Pipeline state machine over many independent tasks
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("live_tasks", &self.live_tasks())
            .finish_non_exhaustive()
    }
}

// Mutations and the events they produce, committed together. Works on a
// copy of the live record; the copy replaces it only once persisted.
struct Step {
    record: TaskRecord,
    events: Vec<EventKind>,
}

impl Step {
    fn new(record: &TaskRecord) -> Self {
        Self {
            record: record.clone(),
            events: Vec::new(),
        }
    }

    fn say(&mut self, agent: Agent, content: impl Into<String>) {
        let message = self.record.append_message(agent, content);
        self.events.push(EventKind::AgentMessage {
            agent: message.agent,
            content: message.content,
        });
    }

    fn artifact(&mut self, kind: ArtifactKind) {
        self.events.push(EventKind::ArtifactUpdated { kind });
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), OrchestratorError> {
        let from = self.record.transition(to)?;
        tracing::info!(
            task_id = %self.record.id,
            from = %from,
            to = %to,
            iteration = self.record.iteration_count,
            "task transition"
        );
        self.events.push(EventKind::StatusChanged { old: from, new: to });
        if to.is_terminal() {
            self.events.push(EventKind::WorkflowCompleted { outcome: to });
        }
        Ok(())
    }
}

fn unexpected(expected: &'static str, actual: &StageArtifact) -> ExecutorError {
    ExecutorError::UnexpectedArtifact {
        expected,
        actual: actual.name(),
    }
}

fn file_list(files: &FileMap) -> String {
    files.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

impl Orchestrator {
    /// Start building an orchestrator over the two mandatory collaborators
    pub fn builder(
        executor: Arc<dyn StageExecutor>,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: PipelineConfig::default(),
            store: None,
            executor,
            sandbox,
            retrieval: None,
            publisher: None,
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Stage worker statistics
    #[must_use]
    pub fn worker_stats(&self) -> PoolStats {
        self.inner.workers.stats()
    }

    /// Tasks currently held in memory
    ///
    /// Terminal tasks are dropped once persisted and reloaded on demand.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Create a `pending` task
    ///
    /// # Errors
    /// - `InvalidRequest` for an empty description or malformed id
    /// - `DuplicateTask` when the id is taken
    pub async fn create_task(&self, request: CreateTask) -> Result<TaskId, OrchestratorError> {
        let description = request.description.trim();
        if description.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "task description must not be empty".into(),
            ));
        }
        let id = match request.external_id.as_deref() {
            Some(raw) => TaskId::parse(raw)?,
            None => TaskId::generate(),
        };
        let record = TaskRecord::new(
            id.clone(),
            description,
            request.repo,
            self.inner.config.max_iterations,
        );
        match self.inner.store.insert(&record).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(id)) => return Err(OrchestratorError::DuplicateTask(id)),
            Err(e) => return Err(e.into()),
        }
        self.inner.bus.open(&id);
        self.inner
            .tasks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(record)));
        tracing::info!(task_id = %id, "task created");
        Ok(id)
    }

    /// Create a task and drive it in the background
    ///
    /// # Errors
    /// As [`Self::create_task`]
    pub async fn submit(&self, request: CreateTask) -> Result<TaskId, OrchestratorError> {
        let id = self.create_task(request).await?;
        drop(self.spawn_drive(id.clone()));
        Ok(id)
    }

    /// Drive a task to its next checkpoint on the runtime
    pub fn spawn_drive(&self, id: TaskId) -> JoinHandle<Result<TaskStatus, OrchestratorError>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.run_until_checkpoint(&id).await;
            if let Err(e) = &result {
                tracing::error!(task_id = %id, error = %e, "background drive stopped");
            }
            result
        })
    }

    /// Perform exactly one transition
    ///
    /// Terminal tasks and tasks awaiting a human are left untouched; their
    /// status is returned as-is.
    ///
    /// # Errors
    /// `TaskNotFound`, or `Store` when persisting the transition failed
    pub async fn advance(&self, id: &TaskId) -> Result<TaskStatus, OrchestratorError> {
        let cell = self.cell(id).await?;
        let mut record = cell.lock().await;
        if !record.status.is_drivable() {
            return Ok(record.status);
        }
        let mut step = Step::new(&record);
        self.drive_step(&mut step).await?;
        self.commit(&cell, &mut record, step).await
    }

    /// Advance until the task is terminal or awaiting approval
    ///
    /// # Errors
    /// As [`Self::advance`]
    pub async fn run_until_checkpoint(&self, id: &TaskId) -> Result<TaskStatus, OrchestratorError> {
        loop {
            let status = self.advance(id).await?;
            if !status.is_drivable() {
                return Ok(status);
            }
        }
    }

    /// Approve a task at `awaiting_approval` and publish it
    ///
    /// # Errors
    /// `InvalidState` unless the task is `awaiting_approval` with no advance
    /// in flight; the record is not touched in that case
    pub async fn approve(&self, id: &TaskId) -> Result<TaskStatus, OrchestratorError> {
        let cell = self.cell(id).await?;
        let mut record = self.claim(&cell, id, "approve").await?;

        let mut step = Step::new(&record);
        step.record.is_approved = Some(true);
        step.say(Agent::System, "Approved by human reviewer.");
        step.transition(TaskStatus::Approved)?;
        self.commit(&cell, &mut record, step).await?;

        let mut step = Step::new(&record);
        self.drive_step(&mut step).await?;
        self.commit(&cell, &mut record, step).await
    }

    /// Reject a task at `awaiting_approval`
    ///
    /// # Errors
    /// As [`Self::approve`]
    pub async fn reject(
        &self,
        id: &TaskId,
        reason: Option<&str>,
    ) -> Result<TaskStatus, OrchestratorError> {
        let cell = self.cell(id).await?;
        let mut record = self.claim(&cell, id, "reject").await?;

        let message = format!(
            "Rejected: {}",
            reason.filter(|r| !r.trim().is_empty()).unwrap_or("no reason given")
        );
        let mut step = Step::new(&record);
        step.record.is_approved = Some(false);
        step.record.error_message = Some(message.clone());
        step.say(Agent::System, message);
        step.transition(TaskStatus::Rejected)?;
        self.commit(&cell, &mut record, step).await
    }

    /// Last persisted snapshot of a task
    ///
    /// # Errors
    /// `TaskNotFound` for an unknown id
    pub async fn get_task(&self, id: &TaskId) -> Result<TaskRecord, OrchestratorError> {
        self.inner
            .store
            .load(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.clone()))
    }

    /// All persisted tasks, newest first
    ///
    /// # Errors
    /// `Store` when the store cannot be read
    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, OrchestratorError> {
        let mut records = self.inner.store.list().await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Observe a task's events from now on
    ///
    /// # Errors
    /// `TaskNotFound` for an unknown id
    pub async fn subscribe(&self, id: &TaskId) -> Result<Subscription, OrchestratorError> {
        self.cell(id).await?;
        Ok(self.inner.bus.subscribe(id))
    }

    /// Re-drive every persisted task a restart interrupted
    ///
    /// Tasks waiting on a human and terminal tasks are skipped.
    ///
    /// # Errors
    /// `Store` when the store cannot be read
    pub async fn resume_pending(&self) -> Result<Vec<TaskId>, OrchestratorError> {
        let mut records = self.inner.store.list().await?;
        records.retain(|r| r.status.is_drivable());
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut resumed = Vec::with_capacity(records.len());
        for record in records {
            tracing::info!(task_id = %record.id, status = %record.status, "resuming task");
            drop(self.spawn_drive(record.id.clone()));
            resumed.push(record.id);
        }
        Ok(resumed)
    }

    async fn cell(&self, id: &TaskId) -> Result<TaskCell, OrchestratorError> {
        let cached = self.inner.tasks.get(id).map(|cell| Arc::clone(cell.value()));
        if let Some(cell) = cached {
            return Ok(cell);
        }
        let record = self
            .inner
            .store
            .load(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.clone()))?;
        // Terminal records are immutable; serve them without caching.
        if record.is_terminal() {
            return Ok(Arc::new(Mutex::new(record)));
        }
        let cell = Arc::clone(
            self.inner
                .tasks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(record)))
                .value(),
        );
        self.inner.bus.open(id);
        Ok(cell)
    }

    // Lock for a human decision without waiting on an in-flight advance.
    async fn claim<'c>(
        &self,
        cell: &'c TaskCell,
        id: &TaskId,
        command: &'static str,
    ) -> Result<MutexGuard<'c, TaskRecord>, OrchestratorError> {
        let Ok(guard) = cell.try_lock() else {
            let status = self
                .inner
                .store
                .load(id)
                .await?
                .map_or(TaskStatus::Pending, |r| r.status);
            tracing::debug!(task_id = %id, command, "command refused: advance in flight");
            return Err(OrchestratorError::invalid_state(id.clone(), status, command));
        };
        if guard.status != TaskStatus::AwaitingApproval {
            return Err(OrchestratorError::invalid_state(id.clone(), guard.status, command));
        }
        Ok(guard)
    }

    // Persist the step, then make it live and publish its events. A failed
    // save leaves the live record, the store and observers where they were.
    async fn commit(
        &self,
        cell: &TaskCell,
        live: &mut TaskRecord,
        step: Step,
    ) -> Result<TaskStatus, OrchestratorError> {
        let Step { record, events } = step;
        if let Err(e) = self.inner.store.save(&record).await {
            tracing::error!(task_id = %record.id, error = %e, "failed to persist task");
            return Err(e.into());
        }
        *live = record;
        for kind in events {
            self.inner.bus.publish(&live.id, kind);
        }
        if live.is_terminal() {
            self.inner
                .tasks
                .remove_if(&live.id, |_, cached| Arc::ptr_eq(cached, cell));
        }
        Ok(live.status)
    }

    async fn drive_step(&self, step: &mut Step) -> Result<(), OrchestratorError> {
        let outcome = match step.record.status {
            TaskStatus::Pending => Ok(TaskStatus::PmProcessing),
            TaskStatus::PmProcessing => self.run_spec(step).await,
            TaskStatus::DevProcessing => self.run_implement(step).await,
            TaskStatus::QaProcessing => self.run_tests(step).await,
            TaskStatus::SandboxRunning => self.run_sandbox(step).await,
            TaskStatus::ReviewProcessing => self.run_review(step).await,
            TaskStatus::Approved => self.run_publish(step).await,
            TaskStatus::AwaitingApproval
            | TaskStatus::Rejected
            | TaskStatus::Completed
            | TaskStatus::Failed => return Ok(()),
        };
        match outcome {
            Ok(next) => {
                step.transition(next)?;
                if next == TaskStatus::AwaitingApproval {
                    step.say(Agent::System, AWAITING_APPROVAL_MESSAGE);
                }
                Ok(())
            }
            Err(failure) => Self::fail(step, &failure),
        }
    }

    fn fail(step: &mut Step, failure: &StageFailure) -> Result<(), OrchestratorError> {
        let message = failure.to_string();
        tracing::warn!(
            task_id = %step.record.id,
            status = %step.record.status,
            error = %message,
            "task failed"
        );
        step.record.error_message = Some(message.clone());
        step.say(Agent::System, format!("Error: {message}"));
        step.events.push(EventKind::Error { message });
        step.transition(TaskStatus::Failed)
    }

    async fn call_stage(
        &self,
        stage: StageKind,
        context: StageContext,
    ) -> Result<StageArtifact, ExecutorError> {
        tracing::debug!(task_id = %context.task_id, %stage, "dispatching stage");
        let timeout = self.inner.config.stage_timeout();
        match self
            .inner
            .workers
            .execute(timeout, self.inner.executor.run(stage, context))
            .await
        {
            Ok(result) => result,
            Err(PoolError::TimedOut(_)) => Err(ExecutorError::Timeout {
                secs: self.inner.config.stage_timeout_secs,
            }),
            Err(PoolError::Closed) => Err(ExecutorError::PoolClosed),
        }
    }

    async fn run_spec(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        let context = StageContext::from_record(&step.record);
        let spec: SpecArtifact = match self.call_stage(StageKind::Spec, context).await? {
            StageArtifact::Spec(spec) => spec,
            other => return Err(unexpected("spec", &other).into()),
        };
        step.say(
            Agent::Pm,
            format!(
                "Specification ready: {} subtask(s), {} acceptance criteria.",
                spec.breakdown.len(),
                spec.acceptance_criteria.len()
            ),
        );
        step.record.spec = Some(spec);
        step.artifact(ArtifactKind::Spec);
        Ok(TaskStatus::DevProcessing)
    }

    async fn run_implement(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        let mut context = StageContext::from_record(&step.record);
        context.retrieved = self.retrieve(&context).await;
        let files = match self.call_stage(StageKind::Implement, context).await? {
            StageArtifact::Code(files) => files,
            other => return Err(unexpected("code", &other).into()),
        };
        let verb = if step.record.iteration_count == 0 {
            "Generated"
        } else {
            "Revised"
        };
        step.say(
            Agent::Dev,
            format!("{verb} {} code file(s): {}", files.len(), file_list(&files)),
        );
        step.record.code_files = files;
        step.artifact(ArtifactKind::Code);
        Ok(TaskStatus::QaProcessing)
    }

    async fn retrieve(&self, context: &StageContext) -> Vec<Snippet> {
        let Some(retrieval) = &self.inner.retrieval else {
            return Vec::new();
        };
        let mut query = context.description.clone();
        if let Some(spec) = &context.spec {
            query.push_str("\n\n");
            query.push_str(&spec.text);
        }
        let timeout = self.inner.config.stage_timeout();
        match tokio::time::timeout(timeout, retrieval.query(&query, RETRIEVAL_LIMIT)).await {
            Ok(Ok(snippets)) => snippets,
            Ok(Err(e)) => {
                tracing::warn!(task_id = %context.task_id, error = %e, "retrieval failed; continuing without context");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(task_id = %context.task_id, "retrieval timed out; continuing without context");
                Vec::new()
            }
        }
    }

    async fn run_tests(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        let context = StageContext::from_record(&step.record);
        let files = match self.call_stage(StageKind::Test, context).await? {
            StageArtifact::Tests(files) => files,
            other => return Err(unexpected("tests", &other).into()),
        };
        step.say(
            Agent::Qa,
            format!("Generated {} test file(s): {}", files.len(), file_list(&files)),
        );
        step.record.test_files = files;
        step.artifact(ArtifactKind::Tests);
        Ok(TaskStatus::SandboxRunning)
    }

    async fn run_sandbox(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        if step.record.code_files.is_empty() {
            return Err(StageFailure::Aborted("No code files to execute".into()));
        }
        let request = SandboxRequest::new(
            step.record.code_files.clone(),
            step.record.test_files.clone(),
        )
        .with_limits(self.inner.config.sandbox);
        tracing::debug!(task_id = %step.record.id, "dispatching sandbox run");
        let result = self.inner.sandbox.run(request).await?;

        let passed = result.succeeded();
        let mut summary = result.headline();
        if let Some(tests) = result.tests {
            let _ = write!(summary, ". Tests: {tests}");
        }
        step.record.is_tests_passing = Some(passed);
        step.say(Agent::Sandbox, summary);
        step.record.sandbox_report = Some(result);
        step.artifact(ArtifactKind::SandboxReport);
        Ok(TaskStatus::ReviewProcessing)
    }

    async fn run_review(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        let context = StageContext::from_record(&step.record);
        let verdict: ReviewVerdict = match self.call_stage(StageKind::Review, context).await? {
            StageArtifact::Review(verdict) => verdict,
            other => return Err(unexpected("review", &other).into()),
        };
        let feedback = verdict.feedback();
        let decision = verdict.decision;
        let summary = verdict.summary.clone();
        step.record.review = Some(verdict);
        step.artifact(ArtifactKind::Review);

        let max = step.record.max_iterations;
        match decision {
            ReviewDecision::Approve => {
                step.say(Agent::Reviewer, format!("Approved: {feedback}"));
                Ok(TaskStatus::AwaitingApproval)
            }
            ReviewDecision::Fail => {
                step.say(Agent::Reviewer, format!("Failed: {feedback}"));
                Err(StageFailure::Aborted(format!("Review failed: {summary}")))
            }
            ReviewDecision::Revise if step.record.can_revise() => {
                let next = step.record.iteration_count + 1;
                step.say(
                    Agent::Reviewer,
                    format!("Revision requested ({next}/{max}): {feedback}"),
                );
                step.record.begin_revision();
                Ok(TaskStatus::DevProcessing)
            }
            ReviewDecision::Revise => {
                step.say(Agent::Reviewer, format!("Revision requested: {feedback}"));
                step.say(
                    Agent::System,
                    format!(
                        "Maximum revisions reached ({max}/{max}); handing off for human approval with review feedback outstanding."
                    ),
                );
                Ok(TaskStatus::AwaitingApproval)
            }
        }
    }

    async fn run_publish(&self, step: &mut Step) -> Result<TaskStatus, StageFailure> {
        let target = step
            .record
            .repo
            .as_ref()
            .and_then(RepoContext::publish_target);
        let (Some(target), Some(publisher)) = (target, self.inner.publisher.as_ref()) else {
            step.say(
                Agent::System,
                "No publish target configured; publishing skipped.",
            );
            return Ok(TaskStatus::Completed);
        };

        let request = PublishRequest::from_record(&step.record);
        let timeout = self.inner.config.stage_timeout();
        tracing::debug!(task_id = %step.record.id, %target, "publishing");
        let reference = match self
            .inner
            .workers
            .execute(timeout, publisher.publish(request, &target))
            .await
        {
            Ok(result) => result?,
            Err(PoolError::TimedOut(_)) => {
                return Err(PublishError::Timeout {
                    secs: self.inner.config.stage_timeout_secs,
                }
                .into())
            }
            Err(PoolError::Closed) => return Err(PublishError::PoolClosed.into()),
        };
        step.say(Agent::System, format!("Published to {target}: {reference}"));
        step.record.pr_reference = Some(reference.url);
        Ok(TaskStatus::Completed)
    }
}
