use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::sandbox::SandboxState;

#[derive(Parser, Debug)]
#[clap(name = "wsb")]
#[clap(version, about = "Lifecycle manager for disposable Windows Sandbox environments")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Manager configuration file path
    #[clap(short, long, global = true, env = "WSB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and start a sandbox from a configuration file
    Create(CreateArgs),

    /// Shut down sandbox(es)
    Shutdown(ShutdownArgs),

    /// List sandboxes
    List(ListArgs),

    /// Execute a command in a running sandbox
    Exec(ExecArgs),

    /// Watch sandbox resource usage
    Monitor(MonitorArgs),

    /// Show host capabilities and available isolation platforms
    Status,

    /// Initialize a new wsb configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Sandbox Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Sandbox configuration file (.toml or .json)
    pub config_file: PathBuf,

    /// Override the sandbox name from the configuration
    #[clap(long, short = 'n')]
    pub name: Option<String>,

    /// Command to run once the sandbox is up (repeatable)
    #[clap(long = "exec", short = 'x')]
    pub exec: Vec<String>,

    /// Stay attached and show resource usage until Ctrl-C
    #[clap(long, short = 'w')]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct ShutdownArgs {
    /// Sandbox ID (full or short)
    pub id: Option<String>,

    /// Sandbox name to shut down
    #[clap(long, conflicts_with = "id")]
    pub name: Option<String>,

    /// Shut down every sandbox
    #[clap(long, conflicts_with_all = ["id", "name"])]
    pub all: bool,

    /// Shutdown timeout in seconds (defaults to each sandbox's configured timeout)
    #[clap(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show sandboxes in this state
    #[clap(long, value_enum)]
    pub state: Option<SandboxState>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Sandbox ID or name
    pub sandbox: String,

    /// Command to execute
    pub command: String,

    /// Command timeout in seconds
    #[clap(long, default_value = "300")]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Sandbox ID or name
    pub sandbox: Option<String>,

    /// Monitor every running sandbox
    #[clap(long, conflicts_with = "sandbox")]
    pub all: bool,

    /// Refresh interval in seconds
    #[clap(long, default_value = "5")]
    pub interval: u64,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
