//! Request, result and configuration types for sandbox runs
//!
//! Defines:
//! - Resource limits applied to every run
//! - The run request (file snapshot + limits + optional command)
//! - The summarized result retained after the environment is destroyed
//! - Engine configuration

use crate::summary::TestSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Snapshot of files keyed by workspace-relative path
pub type FileMap = BTreeMap<String, String>;

/// Hard resource ceilings for a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time ceiling in seconds
    pub max_cpu_seconds: u64,
    /// Memory ceiling in bytes, over the resident size of every process in the run
    pub max_memory_bytes: u64,
    /// Wall-clock ceiling in seconds (authoritative)
    pub max_wall_seconds: u64,
    /// Whether the contained code may reach the network
    pub network_enabled: bool,
}

impl ResourceLimits {
    /// Create default limits
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With CPU ceiling
    #[inline]
    #[must_use]
    pub fn with_cpu_seconds(mut self, secs: u64) -> Self {
        self.max_cpu_seconds = secs;
        self
    }

    /// With memory ceiling
    #[inline]
    #[must_use]
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// With wall-clock ceiling
    #[inline]
    #[must_use]
    pub fn with_wall_seconds(mut self, secs: u64) -> Self {
        self.max_wall_seconds = secs;
        self
    }

    /// With network access
    #[inline]
    #[must_use]
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    /// Wall-clock timeout as a duration
    #[inline]
    #[must_use]
    pub fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.max_wall_seconds)
    }

    /// Reject limits that would make a run meaningless
    pub fn validate(&self) -> Result<(), String> {
        if self.max_wall_seconds == 0 {
            return Err("max_wall_seconds must be greater than zero".to_string());
        }
        if self.max_cpu_seconds == 0 {
            return Err("max_cpu_seconds must be greater than zero".to_string());
        }
        if self.max_memory_bytes < 1024 * 1024 {
            return Err("max_memory_bytes must be at least 1 MiB".to_string());
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 30,
            max_memory_bytes: 512 * 1024 * 1024,
            max_wall_seconds: 60,
            network_enabled: false,
        }
    }
}

/// A single sandbox run request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Implementation files
    pub code_files: FileMap,
    /// Test files
    pub test_files: FileMap,
    /// Resource ceilings
    pub limits: ResourceLimits,
    /// Shell command overriding the engine's test command
    pub command: Option<String>,
}

impl SandboxRequest {
    /// Create new request with default limits
    #[inline]
    #[must_use]
    pub fn new(code_files: FileMap, test_files: FileMap) -> Self {
        Self {
            code_files,
            test_files,
            limits: ResourceLimits::default(),
            command: None,
        }
    }

    /// With limits
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// With explicit shell command
    #[inline]
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Why the engine or the environment terminated a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// Wall-clock ceiling expired
    Timeout,
    /// CPU or memory ceiling breached
    ResourceLimit,
}

impl KillReason {
    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ResourceLimit => "resource_limit",
        }
    }
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output stream, bounded in size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Retained text (lossy UTF-8)
    pub text: String,
    /// Whether bytes beyond the bound were dropped
    pub truncated: bool,
    /// Total bytes the stream produced
    pub total_bytes: u64,
}

impl CapturedOutput {
    /// Build from retained bytes and the stream's total size
    #[must_use]
    pub fn from_bytes(kept: &[u8], total_bytes: u64) -> Self {
        Self {
            text: String::from_utf8_lossy(kept).into_owned(),
            truncated: total_bytes > kept.len() as u64,
            total_bytes,
        }
    }
}

/// Summarized outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Process exit code (`None` when terminated by a signal)
    pub exit_status: Option<i32>,
    /// Captured stdout
    pub stdout: CapturedOutput,
    /// Captured stderr
    pub stderr: CapturedOutput,
    /// Wall-clock time from spawn to exit or kill
    pub wall_time: Duration,
    /// Whether the run was forcibly terminated
    pub was_killed: bool,
    /// Reason for termination
    pub kill_reason: Option<KillReason>,
    /// Parsed test counts, when the output contained a recognizable summary
    pub tests: Option<TestSummary>,
    /// Backend that executed the run
    pub backend: String,
}

impl SandboxResult {
    /// Check whether the run exited cleanly with no failing tests
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.was_killed
            && self.exit_status == Some(0)
            && self.tests.map_or(true, |t| t.is_green())
    }

    /// One-line outcome description
    #[must_use]
    pub fn headline(&self) -> String {
        let secs = self.wall_time.as_secs_f64();
        match (self.kill_reason, self.exit_status) {
            (Some(reason), _) => format!("Execution killed after {secs:.2}s ({reason})"),
            (None, Some(code)) => format!("Execution completed in {secs:.2}s. Exit code: {code}"),
            (None, None) => format!("Execution ended in {secs:.2}s without an exit code"),
        }
    }

    /// Evidence block handed to review: kill reason, test counts and both streams
    #[must_use]
    pub fn evidence(&self) -> String {
        let mut out = self.headline();
        if let Some(tests) = self.tests {
            out.push_str(&format!("\nTests: {tests}"));
        }
        out.push_str("\n=== STDOUT ===\n");
        out.push_str(&self.stdout.text);
        if self.stdout.truncated {
            out.push_str(&format!("\n[stdout truncated: {} bytes total]", self.stdout.total_bytes));
        }
        out.push_str("\n\n=== STDERR ===\n");
        out.push_str(&self.stderr.text);
        if self.stderr.truncated {
            out.push_str(&format!("\n[stderr truncated: {} bytes total]", self.stderr.total_bytes));
        }
        out
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum simultaneous runs; excess requests queue FIFO
    pub max_concurrent_runs: usize,
    /// Per-stream capture bound in bytes
    pub max_output_bytes: usize,
    /// Command template; `{tests}` expands to the quoted test file paths
    pub test_command: String,
    /// Create empty `__init__.py` files so test modules can import the code
    pub scaffold_python_packages: bool,
    /// How long to wait for a killed environment to exit and its streams to close
    pub kill_grace_millis: u64,
    /// How often sampled backends check a run's CPU and memory
    pub monitor_interval_millis: u64,
    /// Accept backends that leave the host filesystem reachable
    pub allow_unconfined_filesystem: bool,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With concurrency bound
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    /// With output bound
    #[inline]
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// With test command template
    #[inline]
    #[must_use]
    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_command = command.into();
        self
    }

    /// With resource sampling interval
    #[inline]
    #[must_use]
    pub fn with_monitor_interval_millis(mut self, millis: u64) -> Self {
        self.monitor_interval_millis = millis;
        self
    }

    /// With acceptance of backends that cannot confine the filesystem
    #[inline]
    #[must_use]
    pub fn with_unconfined_filesystem(mut self, allow: bool) -> Self {
        self.allow_unconfined_filesystem = allow;
        self
    }

    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    /// Sampling interval as a duration, never below 10ms
    #[inline]
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_millis.max(10))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_output_bytes: 64 * 1024,
            test_command: "python -m pytest {tests} -v --tb=short".to_string(),
            scaffold_python_packages: true,
            kill_grace_millis: 2_000,
            monitor_interval_millis: 100,
            allow_unconfined_filesystem: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit: Option<i32>, kill: Option<KillReason>) -> SandboxResult {
        SandboxResult {
            exit_status: exit,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            wall_time: Duration::from_millis(1500),
            was_killed: kill.is_some(),
            kill_reason: kill,
            tests: None,
            backend: "process".to_string(),
        }
    }

    #[test]
    fn default_limits_disable_network() {
        let limits = ResourceLimits::default();
        assert!(!limits.network_enabled);
        assert_eq!(limits.max_wall_seconds, 60);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn engine_defaults_require_filesystem_confinement() {
        let config = EngineConfig::default();
        assert!(!config.allow_unconfined_filesystem);
        assert_eq!(config.monitor_interval(), Duration::from_millis(100));
        assert_eq!(
            config.with_monitor_interval_millis(0).monitor_interval(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn zero_wall_clock_is_rejected() {
        let limits = ResourceLimits::new().with_wall_seconds(0);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn captured_output_signals_truncation() {
        let out = CapturedOutput::from_bytes(b"abc", 10);
        assert!(out.truncated);
        assert_eq!(out.text, "abc");

        let full = CapturedOutput::from_bytes(b"abc", 3);
        assert!(!full.truncated);
    }

    #[test]
    fn killed_run_never_succeeds() {
        assert!(result(Some(0), None).succeeded());
        assert!(!result(Some(1), None).succeeded());
        assert!(!result(None, Some(KillReason::Timeout)).succeeded());
    }

    #[test]
    fn failing_tests_override_zero_exit() {
        let mut r = result(Some(0), None);
        r.tests = Some(TestSummary {
            passed: 2,
            failed: 1,
            ..TestSummary::default()
        });
        assert!(!r.succeeded());
    }

    #[test]
    fn evidence_includes_kill_reason_and_truncation() {
        let mut r = result(None, Some(KillReason::ResourceLimit));
        r.stdout = CapturedOutput::from_bytes(b"partial", 4096);
        let evidence = r.evidence();
        assert!(evidence.contains("resource_limit"));
        assert!(evidence.contains("stdout truncated: 4096 bytes total"));
    }

    #[test]
    fn kill_reason_wire_names() {
        assert_eq!(serde_json::to_string(&KillReason::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(KillReason::ResourceLimit.as_str(), "resource_limit");
    }
}
