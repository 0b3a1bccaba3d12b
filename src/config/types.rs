use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Global manager configuration, read from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WsbConfig {
    pub manager: ManagerConfig,
}

/// The isolation platform used to launch sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Windows Sandbox (Windows 10/11 Pro or Enterprise)
    Windows,
    /// Guest agent as a host child process (development and CI)
    Local,
    /// Automatically select the best available platform
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Which isolation platform to use
    pub platform: PlatformKind,
    /// Directory holding per-sandbox state (descriptors, channel folders)
    pub work_dir: Option<PathBuf>,
    /// Directory containing the `wsb-agent` binary (defaults to the directory of `wsb`)
    pub agent_dir: Option<PathBuf>,
    /// Override for the `WindowsSandbox.exe` launcher path
    pub sandbox_executable: Option<PathBuf>,
    /// Default shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
    /// Append audit events to this JSON-lines file
    pub audit_log: Option<PathBuf>,
    /// Extra process names attributed to a sandbox when sampling resources
    pub monitored_processes: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            platform: PlatformKind::default(),
            work_dir: None,
            agent_dir: None,
            sandbox_executable: None,
            shutdown_timeout_seconds: 30,
            audit_log: None,
            monitored_processes: Vec::new(),
        }
    }
}

/// Declarative configuration for a single sandbox.
///
/// Immutable once handed to [`SandboxManager::create_sandbox`](crate::manager::SandboxManager::create_sandbox).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Human-readable name (not required to be unique)
    pub name: String,
    /// Memory limit in MB
    pub memory_mb: u64,
    /// Number of CPU cores
    pub cpu_cores: u32,
    /// Host folders mapped into the guest
    pub folders: Vec<FolderMapping>,
    /// Environment variables applied to every executed command
    pub environment: HashMap<String, String>,
    /// Commands run once after the sandbox reaches RUNNING
    pub startup_commands: Vec<String>,
    pub security: SecurityConfig,
    pub timeouts: TimeoutConfig,
    pub monitoring: MonitoringConfig,
    pub channel: ChannelConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: "sandbox".to_string(),
            memory_mb: 4096,
            cpu_cores: 2,
            folders: Vec::new(),
            environment: HashMap::new(),
            startup_commands: Vec::new(),
            security: SecurityConfig::default(),
            timeouts: TimeoutConfig::default(),
            monitoring: MonitoringConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// A host folder exposed inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMapping {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable guest networking
    pub networking: bool,
    /// Enable virtualized GPU
    pub vgpu: bool,
    /// Command run at guest logon, before the agent starts
    pub logon_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Seconds to wait for the guest agent to report ready
    pub startup_seconds: u64,
    /// Default command timeout in seconds
    pub exec_seconds: u64,
    /// Default shutdown timeout in seconds
    pub shutdown_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: 120,
            exec_seconds: 300,
            shutdown_seconds: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_seconds)
    }

    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_seconds)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Start the resource monitor once the sandbox is running
    pub enabled: bool,
    /// Sampling interval in milliseconds
    pub interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// How requests reach the guest agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// JSON files exchanged through a mapped folder
    #[default]
    SharedFolder,
    /// TCP to the agent's listener (requires guest networking)
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub transport: TransportKind,
    /// Response polling interval for the shared-folder transport, in milliseconds
    pub poll_interval_ms: u64,
    /// Address the host connects to for the loopback transport
    pub loopback_address: SocketAddr,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            poll_interval_ms: 100,
            loopback_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 47800)),
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
