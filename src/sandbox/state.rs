use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, WsbError};

/// Lifecycle state of a sandbox.
///
/// `Stopped` and `Failed` are terminal; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SandboxState {
    /// Constructed, not yet started
    Pending = 0,
    /// Isolation environment being provisioned
    Creating = 1,
    /// Guest up, execution channel usable
    Running = 2,
    /// Teardown requested
    Stopping = 3,
    /// Terminal, clean
    Stopped = 4,
    /// Terminal, error
    Failed = 5,
}

impl SandboxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Creating,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxEvent {
    /// Start provisioning the isolation session
    Provision,
    /// Guest agent reported ready
    Ready,
    /// Teardown requested
    Stop,
    /// Session exited cleanly during teardown
    Exited,
    /// Unrecoverable error
    Fail,
}

impl fmt::Display for SandboxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provision => "provision",
            Self::Ready => "ready",
            Self::Stop => "stop",
            Self::Exited => "exited",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// The allow-list of edges. Anything not listed is an invalid transition.
pub fn next_state(current: SandboxState, event: SandboxEvent) -> Result<SandboxState> {
    use SandboxEvent as E;
    use SandboxState as S;

    let next = match (current, event) {
        (S::Pending, E::Provision) => S::Creating,
        (S::Creating, E::Ready) => S::Running,
        (S::Pending | S::Creating | S::Running, E::Stop) => S::Stopping,
        (S::Stopping, E::Exited) => S::Stopped,
        (S::Pending | S::Creating | S::Running | S::Stopping, E::Fail) => S::Failed,
        (from, event) => return Err(WsbError::InvalidStateTransition { from, event }),
    };

    Ok(next)
}

/// Holds the current state of one sandbox.
///
/// Writers serialize through `transition`; readers use [`StateCell::load`],
/// a single atomic load that never waits on a writer.
#[derive(Debug)]
pub(crate) struct StateCell {
    value: AtomicU8,
    guard: Mutex<()>,
    changes: watch::Sender<SandboxState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(SandboxState::Pending);
        Self {
            value: AtomicU8::new(SandboxState::Pending as u8),
            guard: Mutex::new(()),
            changes,
        }
    }

    pub fn load(&self) -> SandboxState {
        SandboxState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Apply `event`, returning the `(from, to)` pair on success.
    ///
    /// On error the state is left untouched.
    pub fn transition(&self, event: SandboxEvent) -> Result<(SandboxState, SandboxState)> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let from = self.load();
        let to = next_state(from, event)?;
        self.value.store(to as u8, Ordering::Release);
        self.changes.send_replace(to);
        Ok((from, to))
    }

    /// Receiver notified after every successful transition.
    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.changes.subscribe()
    }
}
