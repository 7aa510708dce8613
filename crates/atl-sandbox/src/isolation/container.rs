//! Docker container backend
//!
//! One throwaway container per run, named after the run id so it can be
//! killed and inspected from outside. The workspace is bind-mounted at
//! `/sandbox`. Containers are removed by `sweep`/`terminate` rather than
//! `--rm`, so the runtime's own OOM verdict can be read after exit.

use super::{RunSpec, SandboxBackend};
use crate::types::KillReason;
use std::process::{Command, ExitStatus, Stdio};

const DEFAULT_IMAGE: &str = "python:3.11-slim";
const MOUNT_POINT: &str = "/sandbox";

/// Backend running scripts in disposable Docker containers
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    runtime: String,
    image: String,
    cpus: String,
    pids_limit: u32,
}

impl ContainerBackend {
    /// Docker backend with the default Python image
    #[must_use]
    pub fn new() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            cpus: "1".to_string(),
            pids_limit: 128,
        }
    }

    /// With container image
    #[inline]
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// With container runtime binary (e.g. `podman`)
    #[inline]
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// With CPU share (`--cpus`)
    #[inline]
    #[must_use]
    pub fn with_cpus(mut self, cpus: impl Into<String>) -> Self {
        self.cpus = cpus.into();
        self
    }

    /// Image runs are started from
    #[inline]
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    fn container_name(run_id: &str) -> String {
        format!("atl-sbx-{}", run_id.to_ascii_lowercase())
    }

    async fn runtime(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        tokio::process::Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
    }
}

// `docker inspect --format '{{.State.OOMKilled}}'` prints `true` or `false`.
fn oom_killed(inspect_stdout: &[u8]) -> bool {
    String::from_utf8_lossy(inspect_stdout).trim() == "true"
}

impl Default for ContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SandboxBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        let status = tokio::process::Command::new(&self.runtime)
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) => s.success(),
            Err(e) => {
                tracing::debug!(runtime = %self.runtime, error = %e, "container runtime not reachable");
                false
            }
        }
    }

    fn isolates_network(&self) -> bool {
        true
    }

    fn isolates_filesystem(&self) -> bool {
        true
    }

    fn command(&self, spec: &RunSpec<'_>) -> Command {
        let limits = spec.limits;
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["run", "--init", "-i"])
            .arg("--name")
            .arg(Self::container_name(spec.run_id))
            .arg("--memory")
            .arg(limits.max_memory_bytes.to_string())
            .arg("--memory-swap")
            .arg(limits.max_memory_bytes.to_string())
            .arg("--cpus")
            .arg(&self.cpus)
            .arg("--ulimit")
            .arg(format!("cpu={0}:{0}", limits.max_cpu_seconds))
            .arg("--pids-limit")
            .arg(self.pids_limit.to_string())
            .args(["--cap-drop", "ALL", "--security-opt", "no-new-privileges"])
            .args(["-e", "PYTHONDONTWRITEBYTECODE=1", "-e"])
            .arg(format!("PYTHONPATH={MOUNT_POINT}"))
            .arg("-v")
            .arg(format!("{}:{MOUNT_POINT}", spec.workspace.display()))
            .arg("-w")
            .arg(MOUNT_POINT);
        if !limits.network_enabled {
            cmd.args(["--network", "none"]);
        }
        cmd.arg(&self.image).args(["sh", "-c", spec.script]);
        cmd
    }

    async fn terminate(&self, spec: &RunSpec<'_>, _pid: Option<u32>) {
        let name = Self::container_name(spec.run_id);
        // Kills and removes; fails harmlessly when the container never started.
        if let Err(e) = self.runtime(&["rm", "-f", &name]).await {
            tracing::warn!(run_id = spec.run_id, container = %name, error = %e, "failed to remove sandbox container");
        }
    }

    async fn classify_exit(&self, spec: &RunSpec<'_>, _status: &ExitStatus) -> Option<KillReason> {
        let name = Self::container_name(spec.run_id);
        match self
            .runtime(&["inspect", "--format", "{{.State.OOMKilled}}", &name])
            .await
        {
            Ok(output) if output.status.success() && oom_killed(&output.stdout) => {
                Some(KillReason::ResourceLimit)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(run_id = spec.run_id, container = %name, error = %e, "failed to inspect sandbox container");
                None
            }
        }
    }
}
