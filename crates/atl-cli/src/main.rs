//! `atl` - run code through the sandbox and inspect persisted tasks

use anyhow::{bail, Context, Result};
use atl_core::{FileTaskStore, PipelineConfig, TaskId, TaskRecord, TaskStore};
use atl_sandbox::{
    ContainerBackend, FileMap, ProcessBackend, SandboxBackend, SandboxEngine, SandboxRequest,
    SandboxResult,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const MIB: u64 = 1024 * 1024;

fn cli() -> Command {
    Command::new("atl")
        .version(atl_core::VERSION)
        .about("Autonomous tech lead: sandboxed validation and task inspection")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Pipeline configuration file (TOML)"),
        )
        .subcommand(
            Command::new("sandbox")
                .about("Run a directory of code (and tests) inside the sandbox")
                .arg(
                    Arg::new("code")
                        .long("code")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory holding the code files"),
                )
                .arg(
                    Arg::new("tests")
                        .long("tests")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory holding the test files"),
                )
                .arg(
                    Arg::new("command")
                        .long("command")
                        .help("Shell command to run instead of the test command"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_parser(value_parser!(u64))
                        .help("Wall-clock limit in seconds"),
                )
                .arg(
                    Arg::new("memory-mb")
                        .long("memory-mb")
                        .value_parser(value_parser!(u64))
                        .help("Memory limit in MiB (resident, across the whole run)"),
                )
                .arg(
                    Arg::new("cpu-seconds")
                        .long("cpu-seconds")
                        .value_parser(value_parser!(u64))
                        .help("CPU-time limit in seconds"),
                )
                .arg(
                    Arg::new("allow-network")
                        .long("allow-network")
                        .action(ArgAction::SetTrue)
                        .help("Let the run reach the network"),
                )
                .arg(
                    Arg::new("backend")
                        .long("backend")
                        .default_value("auto")
                        .value_parser(["auto", "bwrap", "docker", "process-netns", "process"])
                        .help("Isolation backend; auto picks the first available of bwrap, docker"),
                )
                .arg(
                    Arg::new("allow-unconfined-fs")
                        .long("allow-unconfined-fs")
                        .action(ArgAction::SetTrue)
                        .help("Accept backends that leave the host filesystem reachable"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("tasks")
                .about("List persisted tasks, newest first")
                .arg(store_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Print one persisted task record")
                .arg(store_arg())
                .arg(Arg::new("id").required(true).help("Task id")),
        )
}

fn store_arg() -> Arg {
    Arg::new("store")
        .long("store")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Task store directory")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    match matches.subcommand() {
        Some(("sandbox", args)) => {
            let result = run_sandbox(args, &config).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.evidence());
            }
            std::process::exit(if result.succeeded() { 0 } else { 1 });
        }
        Some(("tasks", args)) => {
            let store = open_store(args).await?;
            let mut tasks = store.list().await?;
            tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks in {}", store.root().display());
            } else {
                for task in &tasks {
                    println!("{}", summary_line(task));
                }
            }
        }
        Some(("show", args)) => {
            let store = open_store(args).await?;
            let raw = args
                .get_one::<String>("id")
                .context("missing task id")?;
            let id = TaskId::parse(raw)?;
            let Some(task) = store.load(&id).await? else {
                bail!("task not found: {id}");
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        _ => bail!("no command given; see --help"),
    }
    Ok(())
}

async fn run_sandbox(args: &ArgMatches, config: &PipelineConfig) -> Result<SandboxResult> {
    let code_dir = args.get_one::<PathBuf>("code").context("missing --code")?;
    let code_files = read_tree(code_dir)?;
    let test_files = match args.get_one::<PathBuf>("tests") {
        Some(dir) => read_tree(dir)?,
        None => FileMap::new(),
    };

    let mut limits = config.sandbox;
    if let Some(secs) = args.get_one::<u64>("timeout") {
        limits = limits.with_wall_seconds(*secs);
    }
    if let Some(mb) = args.get_one::<u64>("memory-mb") {
        limits = limits.with_memory_bytes(mb.saturating_mul(MIB));
    }
    if let Some(secs) = args.get_one::<u64>("cpu-seconds") {
        limits = limits.with_cpu_seconds(*secs);
    }
    if args.get_flag("allow-network") {
        limits = limits.with_network(true);
    }

    let mut request = SandboxRequest::new(code_files, test_files).with_limits(limits);
    if let Some(command) = args.get_one::<String>("command") {
        request = request.with_command(command.as_str());
    }

    let name = args
        .get_one::<String>("backend")
        .map_or("auto", String::as_str);
    let backend = select_backend(name).await?;
    let mut engine_config = config.engine.clone();
    if args.get_flag("allow-unconfined-fs") {
        engine_config = engine_config.with_unconfined_filesystem(true);
    }
    let engine = SandboxEngine::new(backend, engine_config);
    tracing::info!(
        backend = engine.backend_name(),
        files = request.code_files.len() + request.test_files.len(),
        "starting sandbox run"
    );
    Ok(engine.execute(request).await?)
}

fn backend_named(name: &str) -> Option<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match name {
        "bwrap" => Arc::new(ProcessBackend::bubblewrap()),
        "docker" => Arc::new(ContainerBackend::new()),
        "process-netns" => Arc::new(ProcessBackend::with_network_namespace()),
        "process" => Arc::new(ProcessBackend::new()),
        _ => return None,
    };
    Some(backend)
}

const AUTO_BACKENDS: [&str; 2] = ["bwrap", "docker"];

async fn select_backend(name: &str) -> Result<Arc<dyn SandboxBackend>> {
    if name != "auto" {
        return backend_named(name).with_context(|| format!("unknown backend {name}"));
    }
    for candidate in AUTO_BACKENDS {
        let Some(backend) = backend_named(candidate) else { continue };
        if backend.is_available().await {
            return Ok(backend);
        }
        tracing::debug!(backend = candidate, "backend unavailable, trying next");
    }
    bail!(
        "no confining backend available (tried {}); install bubblewrap or docker, \
         or pass --backend process-netns --allow-unconfined-fs",
        AUTO_BACKENDS.join(", ")
    )
}

async fn open_store(args: &ArgMatches) -> Result<FileTaskStore> {
    let root = args.get_one::<PathBuf>("store").context("missing --store")?;
    if !root.is_dir() {
        bail!("store directory {} does not exist", root.display());
    }
    Ok(FileTaskStore::open(root).await?)
}

/// Read every regular file under `dir`, keyed by `/`-separated relative path
fn read_tree(dir: &Path) -> Result<FileMap> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut files = FileMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        files.insert(key, content);
    }
    Ok(files)
}

fn summary_line(task: &TaskRecord) -> String {
    let mut description: String = task.description.chars().take(48).collect();
    if task.description.chars().count() > 48 {
        description.push_str("...");
    }
    format!(
        "{:<28} {:<18} iter {}/{}  {}  {}",
        task.id,
        task.status.as_str(),
        task.iteration_count,
        task.max_iterations,
        task.created_at.format("%Y-%m-%d %H:%M:%S"),
        description
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn read_tree_keys_by_relative_path_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg/.cache")).unwrap();
        std::fs::write(dir.path().join("main.py"), "print(1)\n").unwrap();
        std::fs::write(dir.path().join("pkg/util.py"), "X = 2\n").unwrap();
        std::fs::write(dir.path().join("pkg/.cache/junk"), "junk").unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();

        let files = read_tree(dir.path()).unwrap();

        assert_eq!(
            files.keys().cloned().collect::<Vec<_>>(),
            vec!["main.py".to_string(), "pkg/util.py".to_string()]
        );
        assert_eq!(files["pkg/util.py"], "X = 2\n");
    }

    #[test]
    fn read_tree_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_tree(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn sandbox_flags_parse() {
        let matches = cli()
            .try_get_matches_from([
                "atl", "sandbox", "--code", "src", "--timeout", "5", "--backend", "docker", "--json",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "sandbox");
        assert_eq!(args.get_one::<u64>("timeout"), Some(&5));
        assert_eq!(args.get_one::<String>("backend").map(String::as_str), Some("docker"));
        assert!(args.get_flag("json"));
        assert!(!args.get_flag("allow-network"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(cli()
            .try_get_matches_from(["atl", "sandbox", "--code", "src", "--backend", "vm"])
            .is_err());
    }

    #[test]
    fn default_backend_is_auto_and_every_choice_resolves() {
        let matches = cli()
            .try_get_matches_from(["atl", "sandbox", "--code", "src"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(args.get_one::<String>("backend").map(String::as_str), Some("auto"));
        assert!(!args.get_flag("allow-unconfined-fs"));

        for (name, resolved) in [
            ("bwrap", "bwrap"),
            ("docker", "docker"),
            ("process-netns", "process-netns"),
            ("process", "process"),
        ] {
            assert_eq!(backend_named(name).map(|b| b.name()), Some(resolved));
        }
        assert!(backend_named("auto").is_none());
    }

    #[tokio::test]
    async fn auto_selection_only_offers_confining_backends() {
        match select_backend("auto").await {
            Ok(backend) => {
                assert!(backend.isolates_network());
                assert!(backend.isolates_filesystem());
            }
            Err(e) => assert!(e.to_string().contains("no confining backend")),
        }
    }
}
