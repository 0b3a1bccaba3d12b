//! OS isolation platforms that turn an [`IsolationDescriptor`] into a running session.

mod factory;
mod local;
mod process;
mod windows;

use std::path::Path;

use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::{IsolationDescriptor, SandboxId};

pub use factory::{available_platforms, create_platform, resolve_platform_kind, PlatformInfo};
pub use local::LocalProcessPlatform;
pub use process::ProcessSession;
pub use windows::WindowsSandboxPlatform;

/// A running guest session, treated as an opaque process.
#[async_trait]
pub trait IsolationSession: Send + Sync {
    /// Host pid of the process backing the session, if known.
    fn pid(&self) -> Option<u32>;

    /// Liveness probe. Never blocks waiting for exit.
    async fn has_exited(&self) -> bool;

    /// Resolve once the session has exited. Callers bound this with a timeout.
    async fn wait(&self) -> Result<()>;

    /// Force the session down and wait for it to exit.
    async fn terminate(&self) -> Result<()>;
}

/// Launches isolation sessions.
#[async_trait]
pub trait IsolationPlatform: Send + Sync {
    /// Returns the platform name (e.g., "windows", "local")
    fn name(&self) -> &str;

    /// Reject configurations this platform cannot run. Called before anything
    /// is allocated.
    fn check_config(&self, _config: &SandboxConfig) -> Result<()> {
        Ok(())
    }

    /// Start a session for `descriptor`. `workdir` is private to this sandbox
    /// and exists when this is called.
    async fn launch(
        &self,
        id: SandboxId,
        descriptor: &IsolationDescriptor,
        workdir: &Path,
    ) -> Result<Box<dyn IsolationSession>>;

    /// Host process names that belong to any session of this platform.
    /// Used to attribute resource usage.
    fn session_process_names(&self) -> Vec<String> {
        Vec::new()
    }
}
