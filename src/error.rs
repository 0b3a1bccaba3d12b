use std::time::Duration;

use thiserror::Error;

use crate::sandbox::{SandboxEvent, SandboxId, SandboxState};

#[derive(Error, Debug)]
pub enum WsbError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Lifecycle errors
    #[error("Failed to create sandbox {id}: {source}")]
    SandboxCreation {
        id: SandboxId,
        #[source]
        source: Box<WsbError>,
    },

    #[error("Sandbox not found: {id}")]
    SandboxNotFound { id: String },

    #[error("Sandbox {id} is not running (state: {state})")]
    SandboxNotRunning { id: SandboxId, state: SandboxState },

    #[error("Invalid state transition: cannot apply '{event}' in state {from}")]
    InvalidStateTransition {
        from: SandboxState,
        event: SandboxEvent,
    },

    #[error("Sandbox {id} did not shut down within {timeout:?}; it was terminated forcibly")]
    ShutdownTimeout { id: SandboxId, timeout: Duration },

    #[error("Sandbox {id} failed during shutdown: {reason}")]
    ShutdownFailed { id: SandboxId, reason: String },

    // Execution errors
    #[error("Command rejected: {reason}")]
    Security { reason: String },

    #[error("Command did not complete within {timeout:?}")]
    ExecutionTimeout { timeout: Duration },

    #[error("Execution channel error: {0}")]
    Channel(String),

    // Platform errors
    #[error("Isolation platform error: {0}")]
    Platform(String),

    #[error("Isolation platform '{platform}' is not available: {reason}")]
    PlatformUnavailable { platform: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WsbError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. } | Self::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, WsbError>;
