//! Isolation backends
//!
//! A backend turns a prepared workspace and a set of limits into a command
//! that runs the untrusted script in isolation. The engine owns spawning,
//! stream capture and the wall-clock timer; backends only provide the
//! isolation primitives:
//! - building the confined command
//! - forcibly tearing the environment down
//! - recognizing exits caused by a CPU or memory ceiling
//!
//! Backends whose runtime cannot report ceiling breaches ask the engine to
//! sample the run's process tree instead (see `monitors_usage`).

mod container;
pub(crate) mod monitor;
mod process;

pub use container::ContainerBackend;
pub use process::{Confinement, ProcessBackend};

use crate::types::{KillReason, ResourceLimits};
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::SystemTime;

/// Everything a backend needs to describe one run
#[derive(Debug, Clone, Copy)]
pub struct RunSpec<'a> {
    /// Unique run identifier (lowercase, safe for container names)
    pub run_id: &'a str,
    /// Prepared workspace directory
    pub workspace: &'a Path,
    /// Shell script to execute inside the workspace
    pub script: &'a str,
    /// Resource ceilings
    pub limits: &'a ResourceLimits,
}

/// Container/process runtime providing isolation
#[async_trait::async_trait]
pub trait SandboxBackend: Send + Sync + std::fmt::Debug {
    /// Human-readable name for this backend
    fn name(&self) -> &'static str;

    /// Check if the runtime can provision environments on this host
    async fn is_available(&self) -> bool;

    /// Whether runs with `network_enabled = false` are actually cut off
    fn isolates_network(&self) -> bool;

    /// Whether the run can write only inside its workspace and cannot read
    /// host files beyond the system directories it needs
    fn isolates_filesystem(&self) -> bool;

    /// Whether the engine must police CPU and memory by sampling the run's
    /// process tree
    fn monitors_usage(&self) -> bool {
        false
    }

    /// Build the confined command for a run
    ///
    /// The engine sets stdio, `kill_on_drop` and spawns it.
    fn command(&self, spec: &RunSpec<'_>) -> Command;

    /// Forcibly tear the run down while its root process is still unreaped
    ///
    /// Called on wall-clock expiry and on a sampled ceiling breach.
    async fn terminate(&self, spec: &RunSpec<'_>, pid: Option<u32>);

    /// Clean up after a run whose root process exited at `exited_at`
    async fn sweep(&self, spec: &RunSpec<'_>, pid: Option<u32>, exited_at: SystemTime) {
        let _ = exited_at;
        self.terminate(spec, pid).await;
    }

    /// Map an exit caused by an enforced ceiling to a kill reason
    ///
    /// Called before `sweep`. Exit codes the script chose are never a kill.
    async fn classify_exit(&self, spec: &RunSpec<'_>, status: &ExitStatus) -> Option<KillReason>;
}

/// Quote a string for POSIX `sh`
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("test_a.py"), "'test_a.py'");
        assert_eq!(shell_quote("it's.py"), r"'it'\''s.py'");
    }
}
