//! Sandbox execution engine
//!
//! Provides:
//! - FIFO-bounded concurrency over isolated runs
//! - Workspace provisioning and guaranteed teardown
//! - Authoritative wall-clock enforcement with forced termination
//! - Sampled CPU and memory enforcement for backends that ask for it
//! - Bounded output capture and test summary extraction

use crate::capture::StreamCapture;
use crate::error::SandboxError;
use crate::isolation::monitor::{Breach, ProcessTree};
use crate::isolation::{shell_quote, RunSpec, SandboxBackend};
use crate::summary::TestSummary;
use crate::types::{CapturedOutput, EngineConfig, KillReason, SandboxRequest, SandboxResult};
use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;

/// Anything that can execute a sandbox request
///
/// The orchestrator depends on this seam rather than on the engine directly.
#[async_trait::async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Execute one request to completion (or forced termination)
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError>;
}

/// Point-in-time engine health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Backend name
    pub backend: String,
    /// Whether the backend can currently provision environments
    pub available: bool,
    /// Runs holding a permit
    pub running: usize,
    /// Runs waiting for a permit
    pub queued: usize,
    /// Maximum simultaneous runs
    pub capacity: usize,
}

/// Executes untrusted code against a pluggable isolation backend
#[derive(Debug)]
pub struct SandboxEngine {
    backend: Arc<dyn SandboxBackend>,
    config: EngineConfig,
    permits: Semaphore,
    capacity: usize,
    running: AtomicUsize,
    queued: AtomicUsize,
}

// Increments on creation, decrements on drop (including cancellation).
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// How supervision of a spawned run ended.
enum Ending {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    Killed(KillReason),
}

impl SandboxEngine {
    /// Create engine over a backend
    #[must_use]
    pub fn new(backend: Arc<dyn SandboxBackend>, config: EngineConfig) -> Self {
        let capacity = config.max_concurrent_runs.max(1);
        Self {
            backend,
            config,
            permits: Semaphore::new(capacity),
            capacity,
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Engine configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backend name
    #[inline]
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Report availability and load
    pub async fn health(&self) -> EngineHealth {
        EngineHealth {
            backend: self.backend.name().to_string(),
            available: self.backend.is_available().await,
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Execute a request in a fresh environment
    ///
    /// # Errors
    /// - `InvalidRequest` for unusable limits, escaping paths or nothing to run
    /// - `Unavailable` when the backend cannot provision, cannot honor
    ///   `network_enabled = false`, or cannot confine the filesystem and the
    ///   engine does not allow unconfined runs
    /// - `Internal` when supervision itself fails
    ///
    /// Code that exceeds its limits is not an error; it yields a result with
    /// `was_killed` set.
    pub async fn execute(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError> {
        request.limits.validate().map_err(SandboxError::invalid)?;
        if !request.limits.network_enabled && !self.backend.isolates_network() {
            return Err(SandboxError::unavailable(format!(
                "backend '{}' cannot disable network access",
                self.backend.name()
            )));
        }
        if !self.backend.isolates_filesystem() && !self.config.allow_unconfined_filesystem {
            return Err(SandboxError::unavailable(format!(
                "backend '{}' cannot confine the filesystem to the workspace",
                self.backend.name()
            )));
        }
        let script = self.script_for(&request)?;

        let permit = {
            let _waiting = Gauge::enter(&self.queued);
            self.permits
                .acquire()
                .await
                .map_err(|_| SandboxError::internal("sandbox engine is shut down"))?
        };
        let _running = Gauge::enter(&self.running);

        if !self.backend.is_available().await {
            tracing::error!(backend = self.backend.name(), "sandbox backend unavailable");
            return Err(SandboxError::unavailable(format!(
                "backend '{}' is not available on this host",
                self.backend.name()
            )));
        }

        let workspace = Workspace::provision()?;
        let outcome = self.run_in(&workspace, &request, &script).await;
        workspace.destroy();
        drop(permit);

        if let Err(e) = &outcome {
            if e.is_infrastructure() {
                tracing::error!(backend = self.backend.name(), error = %e, "sandbox run failed");
            }
        }
        outcome
    }

    fn script_for(&self, request: &SandboxRequest) -> Result<String, SandboxError> {
        if let Some(command) = request.command.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(command.to_string());
        }
        if request.test_files.is_empty() {
            return Err(SandboxError::invalid("no test files and no command to run"));
        }
        let tests = request
            .test_files
            .keys()
            .map(|path| shell_quote(path))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(self.config.test_command.replace("{tests}", &tests))
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        request: &SandboxRequest,
        script: &str,
    ) -> Result<SandboxResult, SandboxError> {
        workspace.write_files(&request.code_files).await?;
        workspace.write_files(&request.test_files).await?;
        if self.config.scaffold_python_packages {
            workspace.scaffold_python_packages().await?;
        }

        let run_id = ulid::Ulid::new().to_string().to_ascii_lowercase();
        let spec = RunSpec {
            run_id: &run_id,
            workspace: workspace.path(),
            script,
            limits: &request.limits,
        };
        self.supervise(&spec).await
    }

    /// Resolves once a sampled run breaches its CPU or memory ceiling
    ///
    /// Never resolves for backends that enforce ceilings themselves.
    async fn watch(&self, spec: &RunSpec<'_>, pid: Option<u32>) -> Breach {
        let Some(pid) = pid.filter(|_| self.backend.monitors_usage()) else {
            return std::future::pending().await;
        };
        let mut tree = ProcessTree::new(pid);
        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sampled = tokio::task::spawn_blocking(move || {
                let usage = tree.sample();
                (tree, usage)
            })
            .await;
            let usage = match sampled {
                Ok((sampled_tree, usage)) => {
                    tree = sampled_tree;
                    usage
                }
                Err(e) => {
                    tracing::error!(run_id = spec.run_id, error = %e, "resource sampling failed, ceilings unenforced");
                    return std::future::pending().await;
                }
            };
            if let Some(breach) = usage.breach(spec.limits) {
                tracing::warn!(
                    run_id = spec.run_id,
                    ?breach,
                    memory_bytes = usage.memory_bytes,
                    cpu_ms = u64::try_from(usage.cpu_time.as_millis()).unwrap_or(u64::MAX),
                    processes = usage.processes,
                    "sandbox run breached a resource ceiling, terminating"
                );
                return breach;
            }
        }
    }

    async fn supervise(&self, spec: &RunSpec<'_>) -> Result<SandboxResult, SandboxError> {
        let mut command = self.backend.command(spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                SandboxError::unavailable(format!("cannot launch {} run: {e}", self.backend.name()))
            }
            _ => SandboxError::internal(format!("spawn failed: {e}")),
        })?;
        let pid = child.id();
        tracing::debug!(run_id = spec.run_id, backend = self.backend.name(), ?pid, "sandbox run started");

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|s| StreamCapture::spawn(s, limit));
        let stderr = child.stderr.take().map(|s| StreamCapture::spawn(s, limit));
        let grace = self.config.kill_grace();

        let ending = tokio::select! {
            waited = tokio::time::timeout(spec.limits.wall_timeout(), child.wait()) => match waited {
                Ok(Ok(status)) => Ending::Exited(status),
                Ok(Err(e)) => Ending::WaitFailed(e),
                Err(_) => {
                    tracing::warn!(
                        run_id = spec.run_id,
                        wall_seconds = spec.limits.max_wall_seconds,
                        "sandbox run exceeded wall-clock limit, terminating"
                    );
                    Ending::Killed(KillReason::Timeout)
                }
            },
            _breach = self.watch(spec, pid) => Ending::Killed(KillReason::ResourceLimit),
        };
        let wall_time = started.elapsed();

        let (status, kill_reason) = match ending {
            Ending::Exited(status) => {
                let exited_at = SystemTime::now();
                let kill_reason = self.backend.classify_exit(spec, &status).await;
                // Reap anything the script left running in the background.
                self.backend.sweep(spec, pid, exited_at).await;
                (Some(status), kill_reason)
            }
            Ending::WaitFailed(e) => {
                self.backend.terminate(spec, pid).await;
                return Err(SandboxError::internal(format!("waiting on run failed: {e}")));
            }
            Ending::Killed(reason) => {
                // Signal the group before the root is reaped so its id cannot be reused.
                self.backend.terminate(spec, pid).await;
                if let Err(e) = child.start_kill() {
                    tracing::debug!(run_id = spec.run_id, error = %e, "direct kill failed");
                }
                let status = tokio::time::timeout(grace, child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                (status, Some(reason))
            }
        };

        let (stdout, stderr) = tokio::join!(drain(stdout, grace), drain(stderr, grace));
        let tests = TestSummary::parse(&stdout.text);
        let result = SandboxResult {
            exit_status: status.and_then(|s| s.code()),
            stdout,
            stderr,
            wall_time,
            was_killed: kill_reason.is_some(),
            kill_reason,
            tests,
            backend: self.backend.name().to_string(),
        };
        tracing::info!(
            run_id = spec.run_id,
            backend = %result.backend,
            exit_status = ?result.exit_status,
            kill_reason = ?result.kill_reason,
            wall_ms = u64::try_from(wall_time.as_millis()).unwrap_or(u64::MAX),
            "sandbox run finished"
        );
        Ok(result)
    }
}

async fn drain(capture: Option<StreamCapture>, grace: Duration) -> CapturedOutput {
    match capture {
        Some(capture) => capture.finish(grace).await,
        None => CapturedOutput::default(),
    }
}

#[async_trait::async_trait]
impl SandboxRunner for SandboxEngine {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError> {
        self.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::ProcessBackend;
    use crate::types::FileMap;

    fn engine() -> SandboxEngine {
        SandboxEngine::new(Arc::new(ProcessBackend::new()), EngineConfig::default())
    }

    #[test]
    fn default_script_quotes_every_test_file() {
        let mut tests = FileMap::new();
        tests.insert("test_a.py".to_string(), String::new());
        tests.insert("pkg/test b.py".to_string(), String::new());
        let request = SandboxRequest::new(FileMap::new(), tests);
        let script = engine().script_for(&request).unwrap();
        assert_eq!(script, "python -m pytest 'pkg/test b.py' 'test_a.py' -v --tb=short");
    }

    #[test]
    fn explicit_command_wins() {
        let request = SandboxRequest::new(FileMap::new(), FileMap::new()).with_command("echo ok");
        assert_eq!(engine().script_for(&request).unwrap(), "echo ok");
    }

    #[test]
    fn nothing_to_run_is_invalid() {
        let request = SandboxRequest::new(FileMap::new(), FileMap::new()).with_command("  ");
        assert!(matches!(
            engine().script_for(&request),
            Err(SandboxError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn health_reports_capacity() {
        let engine = SandboxEngine::new(
            Arc::new(ProcessBackend::new()),
            EngineConfig::default().with_max_concurrent_runs(0),
        );
        let health = engine.health().await;
        assert_eq!(health.capacity, 1);
        assert_eq!(health.running, 0);
        assert_eq!(health.backend, "process");
    }
}
