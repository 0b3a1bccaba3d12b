use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{IsolationPlatform, IsolationSession, ProcessSession};
use crate::error::{Result, WsbError};
use crate::sandbox::{IsolationDescriptor, SandboxId};

/// Runs the guest agent as a host child process.
///
/// No isolation at all: guest paths are mapped straight back to the host
/// folders behind them. Meant for development and CI on machines without
/// Windows Sandbox. Memory and networking limits are not enforced.
#[derive(Debug, Default)]
pub struct LocalProcessPlatform;

impl LocalProcessPlatform {
    pub fn new() -> Self {
        Self
    }

    /// Host path of the agent binary, tolerating a missing `.exe` suffix.
    fn agent_program(descriptor: &IsolationDescriptor) -> Result<PathBuf> {
        let program = descriptor
            .resolve_guest_path(&descriptor.agent_program)
            .ok_or_else(|| {
                WsbError::Platform(format!(
                    "Agent path {} is not inside a mapped folder",
                    descriptor.agent_program
                ))
            })?;

        if program.exists() {
            return Ok(program);
        }
        let without_ext = program.with_extension("");
        if without_ext.exists() {
            return Ok(without_ext);
        }
        Err(WsbError::Platform(format!(
            "Guest agent not found at {}",
            program.display()
        )))
    }
}

#[async_trait]
impl IsolationPlatform for LocalProcessPlatform {
    fn name(&self) -> &str {
        "local"
    }

    async fn launch(
        &self,
        id: SandboxId,
        descriptor: &IsolationDescriptor,
        workdir: &Path,
    ) -> Result<Box<dyn IsolationSession>> {
        let program = Self::agent_program(descriptor)?;
        let args: Vec<String> = descriptor
            .agent_args
            .iter()
            .map(|arg| match descriptor.resolve_guest_path(arg) {
                Some(host) => host.display().to_string(),
                None => arg.clone(),
            })
            .collect();

        if descriptor.user_logon_command.is_some() {
            warn!(sandbox_id = %id, "Logon command is not run by the local platform");
        }

        let log = File::create(workdir.join("agent.log"))?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        info!(
            sandbox_id = %id,
            program = %program.display(),
            args = ?args,
            "Launching local guest agent"
        );

        let session = ProcessSession::spawn(command, &format!("wsb-agent[{}]", id.short()))?;
        Ok(Box::new(session))
    }

    fn session_process_names(&self) -> Vec<String> {
        Vec::new()
    }
}
