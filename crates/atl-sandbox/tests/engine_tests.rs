//! Sandbox engine integration tests against the local process backend

use atl_sandbox::{
    EngineConfig, FileMap, KillReason, ProcessBackend, ResourceLimits, SandboxBackend,
    SandboxEngine, SandboxError, SandboxRequest,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

// The plain process backend leaves the host filesystem reachable; these
// tests opt in to that explicitly.
fn engine_with(config: EngineConfig) -> SandboxEngine {
    SandboxEngine::new(
        Arc::new(ProcessBackend::new()),
        config.with_unconfined_filesystem(true),
    )
}

fn engine() -> SandboxEngine {
    engine_with(EngineConfig::default())
}

// The unconfined process backend only accepts networked runs.
fn online() -> ResourceLimits {
    ResourceLimits::default().with_network(true)
}

fn command(cmd: &str) -> SandboxRequest {
    SandboxRequest::default().with_limits(online()).with_command(cmd)
}

#[tokio::test]
async fn successful_run_captures_both_streams() {
    let result = engine()
        .execute(command("echo hello; echo oops >&2"))
        .await
        .unwrap();

    assert_eq!(result.exit_status, Some(0));
    assert_eq!(result.stdout.text, "hello\n");
    assert_eq!(result.stderr.text, "oops\n");
    assert!(!result.was_killed);
    assert!(result.kill_reason.is_none());
    assert!(result.succeeded());
}

#[tokio::test]
async fn non_zero_exit_is_a_result_not_an_error() {
    let result = engine().execute(command("exit 3")).await.unwrap();
    assert_eq!(result.exit_status, Some(3));
    assert!(!result.was_killed);
    assert!(!result.succeeded());
}

#[tokio::test]
async fn wall_clock_expiry_kills_the_run() {
    let limits = online().with_wall_seconds(1);
    let request = SandboxRequest::default()
        .with_limits(limits)
        .with_command("sleep 30");

    let started = Instant::now();
    let result = engine().execute(request).await.unwrap();

    assert!(result.was_killed);
    assert_eq!(result.kill_reason, Some(KillReason::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.headline().contains("timeout"));
}

#[tokio::test]
async fn background_stragglers_do_not_hold_the_run_open() {
    let started = Instant::now();
    let result = engine()
        .execute(command("sleep 30 & echo started"))
        .await
        .unwrap();

    assert_eq!(result.exit_status, Some(0));
    assert!(result.stdout.text.contains("started"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cpu_ceiling_breach_is_reported_as_resource_limit() {
    let limits = online().with_cpu_seconds(1).with_wall_seconds(30);
    let request = SandboxRequest::default()
        .with_limits(limits)
        .with_command("while :; do :; done");

    let result = engine().execute(request).await.unwrap();

    assert!(result.was_killed);
    assert_eq!(result.kill_reason, Some(KillReason::ResourceLimit));
}

#[tokio::test]
async fn large_output_is_bounded_and_flagged() {
    let config = EngineConfig::default().with_max_output_bytes(1024);
    let result = engine_with(config)
        .execute(command("head -c 100000 /dev/zero | tr '\\0' x"))
        .await
        .unwrap();

    assert_eq!(result.stdout.text.len(), 1024);
    assert!(result.stdout.truncated);
    assert_eq!(result.stdout.total_bytes, 100_000);
    assert!(result.evidence().contains("stdout truncated"));
}

#[tokio::test]
async fn files_are_visible_and_workspace_is_destroyed() {
    let mut code = FileMap::new();
    code.insert("pkg/data.txt".to_string(), "payload".to_string());
    let request = SandboxRequest::new(code, FileMap::new())
        .with_limits(online())
        .with_command("cat pkg/data.txt; echo; pwd");

    let result = engine().execute(request).await.unwrap();

    let mut lines = result.stdout.text.lines();
    assert_eq!(lines.next(), Some("payload"));
    let workspace = lines.next().unwrap();
    assert!(workspace.contains("atl-sandbox-"));
    assert!(!std::path::Path::new(workspace).exists());
}

#[tokio::test]
async fn scaffolds_python_packages() {
    let mut code = FileMap::new();
    code.insert("app/main.py".to_string(), "x = 1".to_string());
    let request = SandboxRequest::new(code, FileMap::new())
        .with_limits(online())
        .with_command("test -f __init__.py && test -f app/__init__.py && echo ok");

    let result = engine().execute(request).await.unwrap();
    assert_eq!(result.stdout.text.trim(), "ok");
}

#[tokio::test]
async fn test_summary_is_parsed_from_stdout() {
    let result = engine()
        .execute(command("echo '==== 1 failed, 3 passed in 0.10s ===='; exit 1"))
        .await
        .unwrap();

    let tests = result.tests.unwrap();
    assert_eq!(tests.passed, 3);
    assert_eq!(tests.failed, 1);
    assert!(result.evidence().contains("Tests: 3 passed, 1 failed"));
}

#[tokio::test]
async fn exit_codes_above_128_are_reported_raw() {
    let result = engine().execute(command("exit 137")).await.unwrap();
    assert_eq!(result.exit_status, Some(137));
    assert!(!result.was_killed);
    assert_eq!(result.kill_reason, None);
}

#[tokio::test]
async fn memory_ceiling_breach_is_reported_as_resource_limit() {
    // Command substitution holds 128 MiB in the shell itself.
    let limits = online().with_memory_bytes(32 * MIB).with_wall_seconds(30);
    let request = SandboxRequest::default()
        .with_limits(limits)
        .with_command("x=$(head -c 134217728 /dev/zero | tr '\\0' x); sleep 30");

    let started = Instant::now();
    let result = engine().execute(request).await.unwrap();

    assert!(result.was_killed);
    assert_eq!(result.kill_reason, Some(KillReason::ResourceLimit));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(result.headline().contains("resource_limit"));
}

fn process_alive(pid: &str) -> bool {
    // Zombies awaiting an init that never reaps count as gone.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| stat.rsplit(')').next().map_or(false, |rest| !rest.trim_start().starts_with('Z')))
        .unwrap_or(false)
}

#[tokio::test]
async fn background_stragglers_are_killed_after_exit() {
    let result = engine()
        .execute(command("sleep 30 & echo $!"))
        .await
        .unwrap();
    let straggler = result.stdout.text.trim().to_string();
    assert!(!straggler.is_empty());

    let deadline = Instant::now() + Duration::from_secs(3);
    while process_alive(&straggler) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!process_alive(&straggler));
}

#[tokio::test]
async fn filesystem_confinement_is_required_by_default() {
    let engine = SandboxEngine::new(Arc::new(ProcessBackend::new()), EngineConfig::default());
    let err = engine.execute(command("echo never")).await.unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(ref msg) if msg.contains("filesystem")));

    let netns = SandboxEngine::new(
        Arc::new(ProcessBackend::with_network_namespace()),
        EngineConfig::default(),
    );
    let err = netns
        .execute(SandboxRequest::default().with_command("echo never"))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));
}

// Interface names from /proc/net/dev as seen inside the run.
fn interfaces(proc_net_dev: &str) -> Vec<String> {
    proc_net_dev
        .lines()
        .skip(2)
        .filter_map(|line| line.split(':').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

async fn available(backend: &dyn SandboxBackend) -> bool {
    let available = backend.is_available().await;
    if !available {
        eprintln!("skipping: {} backend unavailable on this host", backend.name());
    }
    available
}

#[tokio::test]
async fn offline_namespace_run_sees_only_loopback() {
    let backend = ProcessBackend::with_network_namespace();
    if !available(&backend).await {
        return;
    }
    let engine = SandboxEngine::new(
        Arc::new(backend),
        EngineConfig::default().with_unconfined_filesystem(true),
    );

    let result = engine
        .execute(SandboxRequest::default().with_command("cat /proc/net/dev"))
        .await
        .unwrap();

    assert_eq!(result.exit_status, Some(0));
    assert_eq!(interfaces(&result.stdout.text), vec!["lo".to_string()]);
}

#[tokio::test]
async fn bubblewrap_confines_network_and_filesystem() {
    let backend = ProcessBackend::bubblewrap();
    if !available(&backend).await {
        return;
    }
    let engine = SandboxEngine::new(Arc::new(backend), EngineConfig::default());
    let marker = format!("atl-escape-{}", std::process::id());
    let mut code = FileMap::new();
    code.insert("data.txt".to_string(), "payload".to_string());
    let request = SandboxRequest::new(code, FileMap::new()).with_command(format!(
        "cat data.txt; echo; echo written > out.txt && cat out.txt; \
         echo pwned > /tmp/{marker}; \
         if cat /etc/hostname >/dev/null 2>&1; then echo host-readable; fi; \
         cat /proc/net/dev"
    ));

    let result = engine.execute(request).await.unwrap();

    assert_eq!(result.exit_status, Some(0), "{}", result.evidence());
    let stdout = &result.stdout.text;
    assert!(stdout.starts_with("payload\nwritten\n"));
    assert!(!stdout.contains("host-readable"));
    assert!(!Path::new("/tmp").join(&marker).exists());
    let net = stdout.split_once("Inter-").map(|(_, rest)| format!("Inter-{rest}")).unwrap();
    assert_eq!(interfaces(&net), vec!["lo".to_string()]);
}

#[tokio::test]
async fn unconfined_backend_refuses_offline_runs() {
    let request = SandboxRequest::default().with_command("echo never");
    let err = engine().execute(request).await.unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));
}

#[tokio::test]
async fn escaping_paths_are_rejected() {
    let mut code = FileMap::new();
    code.insert("../escape.py".to_string(), "boom".to_string());
    let request = SandboxRequest::new(code, FileMap::new())
        .with_limits(online())
        .with_command("true");

    let err = engine().execute(request).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));
}

#[tokio::test]
async fn zero_wall_clock_is_rejected_before_running() {
    let request = SandboxRequest::default()
        .with_limits(online().with_wall_seconds(0))
        .with_command("true");
    let err = engine().execute(request).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));
}

#[tokio::test]
async fn excess_runs_queue_behind_the_pool() {
    let engine = Arc::new(engine_with(
        EngineConfig::default().with_max_concurrent_runs(1),
    ));

    let started = Instant::now();
    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.execute(command("sleep 1")).await }
    });
    let second = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.execute(command("sleep 1")).await }
    });

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert!(started.elapsed() >= Duration::from_millis(1900));

    let health = engine.health().await;
    assert_eq!(health.running, 0);
    assert_eq!(health.queued, 0);
}
