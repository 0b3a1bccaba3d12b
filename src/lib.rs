//! Lifecycle management for disposable Windows Sandbox environments.
//!
//! [`manager::SandboxManager`] creates sandboxes from a
//! [`config::SandboxConfig`], runs commands in them through the guest agent
//! and tears them down. Each [`sandbox::Sandbox`] moves through an explicit
//! state machine and reports resource usage through its monitor.

pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod sandbox;
pub mod security;

#[cfg(test)]
mod testing;

pub use error::{Result, WsbError};
