use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};

use crate::cli::args::{
    ConfigAction, ConfigArgs, CreateArgs, ExecArgs, InitArgs, ListArgs, MonitorArgs,
    OutputFormat, ShutdownArgs,
};
use crate::config::{get_config_path, load_sandbox_config, WsbConfig};
use crate::error::{Result, WsbError};
use crate::manager::SandboxManager;
use crate::sandbox::platform::{available_platforms, resolve_platform_kind};
use crate::sandbox::{ExecutionResult, Sandbox, SandboxId, SandboxState, AGENT_EXECUTABLE};

/// Sample sandbox configuration written next to `config.toml` by `init`.
const EXAMPLE_SANDBOX_CONFIG: &str = r#"# Sandbox configuration for `wsb create`
name = "dev"
memory_mb = 4096
cpu_cores = 2
startup_commands = ["ver"]

# [[folders]]
# host_path = 'C:\src\project'
# guest_path = 'C:\Users\WDAGUtilityAccount\Desktop\project'
# readonly = true

[environment]
RUST_LOG = "info"

[security]
networking = false
vgpu = false

[timeouts]
startup_seconds = 300
exec_seconds = 300
shutdown_seconds = 30

[monitoring]
enabled = true
interval_ms = 5000

[channel]
transport = "shared_folder"
"#;

// ============================================================================
// Sandbox Commands
// ============================================================================

/// Create a sandbox, optionally run commands in it and stay attached.
///
/// Sandboxes only live as long as this process, so everything is shut down
/// before returning.
pub async fn create(args: CreateArgs, config: WsbConfig, format: OutputFormat) -> Result<()> {
    let mut sandbox_config = load_sandbox_config(&args.config_file)?;
    if let Some(name) = args.name {
        sandbox_config.name = name;
    }
    info!(name = %sandbox_config.name, config = %args.config_file.display(), "Creating sandbox");

    let manager = SandboxManager::from_config(&config)?;
    let sandbox = manager.create_sandbox(sandbox_config).await?;

    match format {
        OutputFormat::Text => {
            println!("Created sandbox '{}'", sandbox.name());
            println!("  ID:       {}", sandbox.id());
            println!("  State:    {}", sandbox.state());
            println!("  Platform: {}", manager.platform_name());
            println!("  Memory:   {} MB", sandbox.config().memory_mb);
            println!("  CPU:      {} cores", sandbox.config().cpu_cores);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&sandbox.summary())?);
        }
    }

    let mut exit_code = 0;
    for command in &args.exec {
        match manager.execute(sandbox.id(), command, None).await {
            Ok(result) => {
                output_command_result(command, &result, format);
                if !result.success {
                    exit_code = if result.exit_code > 0 { result.exit_code } else { 1 };
                    break;
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code = 1;
                break;
            }
        }
    }

    if args.wait && exit_code == 0 {
        println!("Attached to '{}'. Press Ctrl-C to shut down.", sandbox.name());
        watch_stats(&[sandbox.clone()], Duration::from_secs(5), format).await?;
    }

    let report = manager.shutdown_all(None).await;
    if matches!(format, OutputFormat::Text) {
        println!("Sandbox '{}' is {}", sandbox.name(), sandbox.state());
    }
    if let Some((id, e)) = report.failed.into_iter().next() {
        warn!(sandbox_id = %id, error = %e, "Shutdown failed");
        return Err(e);
    }

    if exit_code != 0 {
        // process::exit skips destructors; flush the audit log first.
        drop(sandbox);
        drop(manager);
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Shut down one sandbox (by ID or name) or all of them
pub async fn shutdown(args: ShutdownArgs, config: WsbConfig, format: OutputFormat) -> Result<()> {
    let manager = SandboxManager::from_config(&config)?;
    let timeout = args.timeout.map(Duration::from_secs);

    if args.all {
        let report = manager.shutdown_all(timeout).await;
        match format {
            OutputFormat::Text => {
                println!("Shut down {} sandbox(es)", report.stopped.len());
                for (id, e) in &report.failed {
                    eprintln!("  {}: {}", id.short(), e);
                }
            }
            OutputFormat::Json => {
                let failed: Vec<_> = report
                    .failed
                    .iter()
                    .map(|(id, e)| serde_json::json!({ "id": id, "error": e.to_string() }))
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({ "stopped": report.stopped, "failed": failed })
                );
            }
        }
        return match report.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        };
    }

    let key = args
        .id
        .or(args.name)
        .ok_or_else(|| WsbError::Config("Must specify sandbox ID, name, or --all".to_string()))?;
    let sandbox = resolve_sandbox(&manager, &key)?;
    manager.shutdown_sandbox(sandbox.id(), timeout).await?;

    match format {
        OutputFormat::Text => println!("Sandbox '{}' shut down", sandbox.name()),
        OutputFormat::Json => println!("{}", serde_json::to_string(&sandbox.summary())?),
    }
    Ok(())
}

/// List sandboxes known to this process
pub async fn list(args: ListArgs, config: WsbConfig, format: OutputFormat) -> Result<()> {
    let manager = SandboxManager::from_config(&config)?;
    let mut sandboxes = manager.list_sandboxes(args.state);
    sandboxes.sort_by_key(|sandbox| sandbox.created_at());

    match format {
        OutputFormat::Text => {
            if sandboxes.is_empty() {
                println!("No sandboxes found.");
                return Ok(());
            }
            println!(
                "{:<10} {:<20} {:<10} {:<10} {:<5} {:<8} CREATED",
                "ID", "NAME", "STATE", "MEMORY", "CPU", "UPTIME"
            );
            println!("{}", "-".repeat(82));
            for sandbox in sandboxes {
                println!(
                    "{:<10} {:<20} {:<10} {:<10} {:<5} {:<8} {}",
                    sandbox.id().short(),
                    sandbox.name(),
                    sandbox.state(),
                    format!("{} MB", sandbox.config().memory_mb),
                    sandbox.config().cpu_cores,
                    format_duration(sandbox.uptime().as_secs()),
                    format_timestamp(sandbox.created_at()),
                );
            }
        }
        OutputFormat::Json => {
            let summaries: Vec<_> = sandboxes.iter().map(|s| s.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }
    Ok(())
}

/// Execute a command in a running sandbox
pub async fn exec(args: ExecArgs, config: WsbConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.sandbox, command = %args.command, "Executing command");

    let manager = SandboxManager::from_config(&config)?;
    let sandbox = resolve_sandbox(&manager, &args.sandbox)?;
    if sandbox.state() != SandboxState::Running {
        return Err(WsbError::SandboxNotRunning {
            id: sandbox.id(),
            state: sandbox.state(),
        });
    }

    let timeout = Duration::from_secs(args.timeout);
    let result = manager
        .execute(sandbox.id(), &args.command, Some(timeout))
        .await?
        .into_result(timeout)?;

    output_command_result(&args.command, &result, format);
    if result.exit_code != 0 {
        drop(sandbox);
        drop(manager);
        std::process::exit(result.exit_code);
    }
    Ok(())
}

/// Print resource usage until Ctrl-C
pub async fn monitor(args: MonitorArgs, config: WsbConfig, format: OutputFormat) -> Result<()> {
    let manager = SandboxManager::from_config(&config)?;

    let sandboxes = if args.all {
        manager.list_sandboxes(Some(SandboxState::Running))
    } else {
        let key = args
            .sandbox
            .ok_or_else(|| WsbError::Config("Must specify sandbox ID or --all".to_string()))?;
        vec![resolve_sandbox(&manager, &key)?]
    };

    if sandboxes.is_empty() {
        println!("No running sandboxes.");
        return Ok(());
    }

    watch_stats(&sandboxes, Duration::from_secs(args.interval.max(1)), format).await
}

/// Show host capabilities and platform availability
pub async fn status(config: WsbConfig, format: OutputFormat) -> Result<()> {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    let os = sysinfo::System::long_os_version()
        .or_else(sysinfo::System::name)
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let total_memory_mb = system.total_memory() / (1024 * 1024);
    let cpus = system.cpus().len();

    let platforms = available_platforms(&config.manager);
    let selected = resolve_platform_kind(&config.manager)
        .map(|kind| format!("{:?}", kind).to_lowercase());
    let agent = locate_agent(&config);

    match format {
        OutputFormat::Text => {
            println!("Host");
            println!("  OS:      {}", os);
            println!("  Arch:    {}", std::env::consts::ARCH);
            println!("  CPUs:    {}", cpus);
            println!("  Memory:  {} MB", total_memory_mb);
            println!();
            println!("Isolation platforms");
            for platform in &platforms {
                let mark = if platform.available { "yes" } else { "no" };
                println!("  {:<8} {:<4} {}", platform.name, mark, platform.description);
                if let Some(reason) = platform.unavailable_reason {
                    println!("           {}", reason);
                }
            }
            println!();
            match &selected {
                Ok(kind) => println!("Selected platform: {}", kind),
                Err(e) => println!("Selected platform: none ({})", e),
            }
            match &agent {
                Some(path) => println!("Guest agent: {}", path.display()),
                None => println!("Guest agent: not found"),
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "host": {
                        "os": os,
                        "arch": std::env::consts::ARCH,
                        "cpus": cpus,
                        "memory_mb": total_memory_mb,
                    },
                    "platforms": platforms,
                    "selected_platform": selected.as_ref().ok(),
                    "agent": agent,
                }))?
            );
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    std::fs::create_dir_all(&config_dir)?;

    let toml_str =
        toml::to_string_pretty(&WsbConfig::default()).map_err(|e| WsbError::Config(e.to_string()))?;
    std::fs::write(&config_path, toml_str)?;

    let example_path = config_dir.join("sandbox.example.toml");
    std::fs::write(&example_path, EXAMPLE_SANDBOX_CONFIG)?;

    println!("Created configuration at: {}", config_path.display());
    println!("Example sandbox configuration: {}", example_path.display());
    println!("\nQuick start:");
    println!("  # Check that Windows Sandbox is available");
    println!("  wsb status");
    println!();
    println!("  # Start a sandbox, run a command and shut it down");
    println!("  wsb create {} --exec \"ver\"", example_path.display());
    println!();
    println!("  # Keep it running and watch resource usage until Ctrl-C");
    println!("  wsb create {} --wait", example_path.display());

    Ok(())
}

pub async fn config(args: ConfigArgs, config: WsbConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| WsbError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Find a sandbox by full ID, name, or unique ID prefix.
fn resolve_sandbox(manager: &SandboxManager, key: &str) -> Result<Arc<Sandbox>> {
    if let Ok(id) = key.parse::<SandboxId>() {
        if let Some(sandbox) = manager.get_sandbox(id) {
            return Ok(sandbox);
        }
    }
    if let Some(sandbox) = manager.get_sandbox_by_name(key) {
        return Ok(sandbox);
    }

    let mut matches: Vec<_> = manager
        .list_sandboxes(None)
        .into_iter()
        .filter(|sandbox| !key.is_empty() && sandbox.id().to_string().starts_with(key))
        .collect();
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(WsbError::SandboxNotFound {
            id: key.to_string(),
        }),
        _ => Err(WsbError::Config(format!(
            "Sandbox ID prefix '{}' is ambiguous",
            key
        ))),
    }
}

async fn watch_stats(
    sandboxes: &[Arc<Sandbox>],
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal?;
                break;
            }
            _ = ticker.tick() => {
                print_stats(sandboxes, format)?;
                if sandboxes.iter().all(|sandbox| sandbox.state().is_terminal()) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn print_stats(sandboxes: &[Arc<Sandbox>], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!(
                "{:<10} {:<20} {:<10} {:>10} {:>7} {:>10} {:>6} {:>8}",
                "ID", "NAME", "STATE", "MEMORY", "CPU", "DISK", "PROCS", "UPTIME"
            );
            for sandbox in sandboxes {
                let stats = sandbox.get_stats();
                println!(
                    "{:<10} {:<20} {:<10} {:>10} {:>6.1}% {:>10} {:>6} {:>8}",
                    sandbox.id().short(),
                    sandbox.name(),
                    sandbox.state(),
                    format!("{} MB", stats.memory_mb),
                    stats.cpu_percent,
                    format!("{} MB", stats.disk_mb),
                    stats.process_count,
                    format_duration(sandbox.uptime().as_secs()),
                );
            }
            println!();
        }
        OutputFormat::Json => {
            for sandbox in sandboxes {
                println!(
                    "{}",
                    serde_json::json!({
                        "id": sandbox.id(),
                        "name": sandbox.name(),
                        "state": sandbox.state(),
                        "stats": sandbox.get_stats(),
                    })
                );
            }
        }
    }
    Ok(())
}

fn output_command_result(command: &str, result: &ExecutionResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            if result.timed_out {
                eprintln!("'{}' timed out after {:.2}s", command, result.duration.as_secs_f64());
            } else if !result.success {
                eprintln!(
                    "'{}' exited with code {} ({:.2}s)",
                    command,
                    result.exit_code,
                    result.duration.as_secs_f64()
                );
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "command": command,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "exit_code": result.exit_code,
                    "duration_ms": result.duration.as_millis() as u64,
                    "timed_out": result.timed_out,
                })
            );
        }
    }
}

fn locate_agent(config: &WsbConfig) -> Option<std::path::PathBuf> {
    let dir = match &config.manager.agent_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_exe().ok()?.parent()?.to_path_buf(),
    };
    let native = AGENT_EXECUTABLE.trim_end_matches(".exe");
    [AGENT_EXECUTABLE, native]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    let local: DateTime<Local> = timestamp.into();
    local.format("%Y-%m-%d %H:%M").to_string()
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d{}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
