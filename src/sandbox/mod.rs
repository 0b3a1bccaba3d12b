pub mod channel;
mod descriptor;
mod instance;
pub mod monitor;
pub mod platform;
mod state;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use descriptor::{IsolationDescriptor, AGENT_EXECUTABLE, AGENT_GUEST_DIR, CHANNEL_GUEST_DIR};
pub use instance::{Sandbox, SandboxServices, SandboxSettings, SandboxSummary};
pub use monitor::{ResourceMonitor, ResourceStats};
pub use state::{next_state, SandboxEvent, SandboxState};

/// Globally unique sandbox identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for tables.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Outcome of one `execute()` call. Not retained by the sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Guest exit code; `-1` when the command timed out
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from request to response (or timeout)
    pub duration: Duration,
    /// True iff the exit code is 0 and the command did not time out
    pub success: bool,
    /// No response arrived within the timeout. The command may still be
    /// running inside the guest: cancellation there is best-effort only.
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn completed(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration,
            success: exit_code == 0,
            timed_out: false,
        }
    }

    pub fn timed_out(duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            success: false,
            timed_out: true,
        }
    }

    /// Turn a timeout into [`WsbError::ExecutionTimeout`](crate::error::WsbError::ExecutionTimeout).
    pub fn into_result(self, timeout: Duration) -> crate::error::Result<Self> {
        if self.timed_out {
            Err(crate::error::WsbError::ExecutionTimeout { timeout })
        } else {
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_id_parse_and_short() {
        let id = SandboxId::new();
        let parsed: SandboxId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().replace('-', "").starts_with(&id.short()));
        assert!("not-a-uuid".parse::<SandboxId>().is_err());
    }

    #[test]
    fn test_execution_result_success_flag() {
        let ok = ExecutionResult::completed(0, "hi\n".into(), String::new(), Duration::ZERO);
        assert!(ok.success);

        let failed = ExecutionResult::completed(2, String::new(), "nope".into(), Duration::ZERO);
        assert!(!failed.success);
        assert!(failed.into_result(Duration::from_secs(1)).is_ok());

        let timed_out = ExecutionResult::timed_out(Duration::from_secs(5));
        assert!(!timed_out.success);
        assert!(timed_out.timed_out);
        assert!(matches!(
            timed_out.into_result(Duration::from_secs(5)),
            Err(crate::error::WsbError::ExecutionTimeout { .. })
        ));
    }
}
