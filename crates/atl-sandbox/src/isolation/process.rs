//! Local process backend
//!
//! Runs the script under `sh` in its own process group with a cleared
//! environment. Ceilings are policed by the engine sampling the process
//! tree; a `ulimit -t` set slightly above the CPU ceiling backs that up.
//!
//! Confinement comes in three strengths:
//! - none, for networked runs on trusted hosts
//! - a private user + network namespace (`unshare`), network only
//! - `bwrap`: read-only system directories, private `/tmp`, the workspace
//!   as the only writable bind, and a private network when asked for

use super::monitor;
use super::{RunSpec, SandboxBackend};
use crate::types::KillReason;
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::time::SystemTime;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
// Seconds of CPU the kernel backstop allows past the sampled ceiling.
const CPU_BACKSTOP_SLACK: u64 = 2;

// Host directories a bubblewrapped script may read.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/opt"];
const SYSTEM_FILES: &[&str] = &[
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/alternatives",
    "/etc/localtime",
];
const NETWORK_FILES: &[&str] = &["/etc/resolv.conf", "/etc/hosts", "/etc/ssl", "/etc/ca-certificates"];

/// How a process run is confined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// No isolation; only networked runs on engines allowing an unconfined
    /// filesystem are accepted
    Unconfined,
    /// Fresh user + network namespace via `unshare`
    NetworkNamespace,
    /// Bubblewrap: private mount, pid, ipc and (optionally) network namespaces
    Bubblewrap,
}

/// Backend running scripts as confined local processes
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    confinement: Confinement,
    search_path: OsString,
}

impl ProcessBackend {
    /// Unconfined process backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            confinement: Confinement::Unconfined,
            search_path: std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into()),
        }
    }

    /// Process backend that runs each script in a private network namespace
    #[must_use]
    pub fn with_network_namespace() -> Self {
        Self {
            confinement: Confinement::NetworkNamespace,
            ..Self::new()
        }
    }

    /// Process backend that runs each script under `bwrap`
    #[must_use]
    pub fn bubblewrap() -> Self {
        Self {
            confinement: Confinement::Bubblewrap,
            ..Self::new()
        }
    }

    /// Override the `PATH` visible to the script
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = path.into();
        self
    }

    /// Confinement mode
    #[inline]
    #[must_use]
    pub fn confinement(&self) -> Confinement {
        self.confinement
    }

    fn confined_script(spec: &RunSpec<'_>) -> String {
        format!(
            "ulimit -t {cpu} || exit 126\n{script}\n",
            cpu = spec.limits.max_cpu_seconds.saturating_add(CPU_BACKSTOP_SLACK),
            script = spec.script,
        )
    }

    fn bwrap_args(spec: &RunSpec<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--die-with-parent",
            "--unshare-user",
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-cgroup-try",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        if !spec.limits.network_enabled {
            args.push("--unshare-net".into());
        }
        let mut read_only = |paths: &[&str]| {
            for path in paths {
                args.extend(["--ro-bind-try", *path, *path].map(OsString::from));
            }
        };
        read_only(SYSTEM_DIRS);
        read_only(SYSTEM_FILES);
        if spec.limits.network_enabled {
            read_only(NETWORK_FILES);
        }
        args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(OsString::from));
        let workspace = spec.workspace.as_os_str();
        args.extend([
            OsString::from("--bind"),
            workspace.to_owned(),
            workspace.to_owned(),
            OsString::from("--chdir"),
            workspace.to_owned(),
        ]);
        args.extend(["--", "sh", "-c"].map(OsString::from));
        args
    }

    fn availability_check(&self) -> tokio::process::Command {
        let (program, args): (&str, &[&str]) = match self.confinement {
            Confinement::Unconfined => ("sh", &["-c", "exit 0"]),
            Confinement::NetworkNamespace => ("unshare", &["--user", "--map-root-user", "--net", "true"]),
            Confinement::Bubblewrap => (
                "bwrap",
                &["--unshare-user", "--unshare-pid", "--unshare-net", "--ro-bind", "/", "/", "--", "true"],
            ),
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        match self.confinement {
            Confinement::Unconfined => "process",
            Confinement::NetworkNamespace => "process-netns",
            Confinement::Bubblewrap => "bwrap",
        }
    }

    async fn is_available(&self) -> bool {
        let mut check = self.availability_check();
        check
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match check.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::debug!(backend = self.name(), error = %e, "availability check failed");
                false
            }
        }
    }

    fn isolates_network(&self) -> bool {
        self.confinement != Confinement::Unconfined
    }

    fn isolates_filesystem(&self) -> bool {
        self.confinement == Confinement::Bubblewrap
    }

    fn monitors_usage(&self) -> bool {
        true
    }

    fn command(&self, spec: &RunSpec<'_>) -> Command {
        let script = Self::confined_script(spec);
        let mut cmd = match self.confinement {
            Confinement::Bubblewrap => {
                let mut cmd = Command::new("bwrap");
                cmd.args(Self::bwrap_args(spec)).arg(script);
                cmd
            }
            Confinement::NetworkNamespace if !spec.limits.network_enabled => {
                let mut cmd = Command::new("unshare");
                cmd.args(["--user", "--map-root-user", "--net", "--", "sh", "-c"]);
                cmd.arg(script);
                cmd
            }
            _ => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
        };
        cmd.env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", spec.workspace)
            .env("TMPDIR", spec.workspace)
            .env("PYTHONPATH", spec.workspace)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("LANG", "C.UTF-8")
            .current_dir(spec.workspace)
            .process_group(0);
        cmd
    }

    async fn terminate(&self, spec: &RunSpec<'_>, pid: Option<u32>) {
        // The child leads its own group and has not been reaped yet, so the
        // group id still names this run.
        if let Some(pid) = pid {
            if monitor::kill_group(pid) {
                tracing::debug!(run_id = spec.run_id, pid, "signalled sandbox process group");
            }
        }
    }

    async fn sweep(&self, spec: &RunSpec<'_>, pid: Option<u32>, exited_at: SystemTime) {
        let Some(pid) = pid else { return };
        let survivors = tokio::task::spawn_blocking(move || monitor::members_started_before(pid, exited_at))
            .await
            .unwrap_or(0);
        if survivors > 0 {
            tracing::debug!(run_id = spec.run_id, pid, survivors, "killing processes left behind by the run");
            monitor::kill_group(pid);
        }
    }

    async fn classify_exit(&self, _spec: &RunSpec<'_>, status: &ExitStatus) -> Option<KillReason> {
        // Only a delivered signal counts; exit codes are the script's own.
        match status.signal().map(Signal::try_from) {
            Some(Ok(Signal::SIGXCPU | Signal::SIGKILL)) => Some(KillReason::ResourceLimit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceLimits;
    use std::path::Path;

    fn spec<'a>(limits: &'a ResourceLimits) -> RunSpec<'a> {
        RunSpec {
            run_id: "01test",
            workspace: Path::new("/tmp/atl-sandbox-test"),
            script: "echo hi",
            limits,
        }
    }

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn script_is_prefixed_with_cpu_backstop_only() {
        let limits = ResourceLimits::new()
            .with_cpu_seconds(5)
            .with_memory_bytes(64 * 1024 * 1024);
        let script = ProcessBackend::confined_script(&spec(&limits));
        assert_eq!(script, "ulimit -t 7 || exit 126\necho hi\n");
    }

    #[test]
    fn command_runs_in_workspace_with_clean_env() {
        let limits = ResourceLimits::default();
        let cmd = ProcessBackend::new().command(&spec(&limits));
        assert_eq!(cmd.get_program(), "sh");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp/atl-sandbox-test")));
        let home = cmd
            .get_envs()
            .find(|(k, _)| *k == "HOME")
            .and_then(|(_, v)| v);
        assert_eq!(home, Some(Path::new("/tmp/atl-sandbox-test").as_os_str()));
    }

    #[test]
    fn namespaced_backend_wraps_with_unshare_only_when_network_disabled() {
        let backend = ProcessBackend::with_network_namespace();
        assert!(backend.isolates_network());
        assert!(!backend.isolates_filesystem());

        let offline = ResourceLimits::default();
        assert_eq!(backend.command(&spec(&offline)).get_program(), "unshare");

        let online = ResourceLimits::default().with_network(true);
        assert_eq!(backend.command(&spec(&online)).get_program(), "sh");
    }

    #[test]
    fn bubblewrap_binds_only_the_workspace_writable() {
        let backend = ProcessBackend::bubblewrap();
        assert!(backend.isolates_network());
        assert!(backend.isolates_filesystem());

        let offline = ResourceLimits::default();
        let cmd = backend.command(&spec(&offline));
        assert_eq!(cmd.get_program(), "bwrap");
        let args = argv(&cmd);
        let joined = args.join(" ");
        assert!(joined.contains("--unshare-net"));
        assert!(joined.contains("--ro-bind-try /usr /usr"));
        assert!(joined.contains("--tmpfs /tmp --bind /tmp/atl-sandbox-test /tmp/atl-sandbox-test"));
        assert!(!joined.contains("/etc/hostname"));
        assert_eq!(args.iter().filter(|a| *a == "--bind").count(), 1);
        assert!(args.last().unwrap().ends_with("echo hi\n"));

        let online = ResourceLimits::default().with_network(true);
        let joined = argv(&backend.command(&spec(&online))).join(" ");
        assert!(!joined.contains("--unshare-net"));
        assert!(joined.contains("/etc/resolv.conf"));
    }

    async fn classify(raw: i32) -> Option<KillReason> {
        let limits = ResourceLimits::default();
        ProcessBackend::new()
            .classify_exit(&spec(&limits), &ExitStatus::from_raw(raw))
            .await
    }

    #[tokio::test]
    async fn only_delivered_signals_classify_as_resource_limit() {
        assert_eq!(classify(Signal::SIGXCPU as i32).await, Some(KillReason::ResourceLimit));
        assert_eq!(classify(Signal::SIGKILL as i32).await, Some(KillReason::ResourceLimit));
        // A script choosing to exit 137 or 152 is not a kill
        assert_eq!(classify(137 << 8).await, None);
        assert_eq!(classify(152 << 8).await, None);
        assert_eq!(classify(1 << 8).await, None);
        assert_eq!(classify(0).await, None);
    }
}
