use std::collections::HashSet;

use crate::config::types::{SandboxConfig, TransportKind};
use crate::error::{Result, WsbError};
use crate::sandbox::{AGENT_GUEST_DIR, CHANNEL_GUEST_DIR};
use crate::security::PathValidator;

const MAX_NAME_LEN: usize = 64;
const MIN_MEMORY_MB: u64 = 512;
const MAX_MEMORY_MB: u64 = 131_072;
const MAX_CPU_CORES: u32 = 64;
const MIN_MONITOR_INTERVAL_MS: u64 = 50;

/// Check a sandbox configuration before any isolation resource is allocated.
pub fn validate_config(config: &SandboxConfig) -> Result<()> {
    validate_name(&config.name)?;

    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&config.memory_mb) {
        return Err(WsbError::Config(format!(
            "memory_mb must be between {} and {}, got {}",
            MIN_MEMORY_MB, MAX_MEMORY_MB, config.memory_mb
        )));
    }

    if config.cpu_cores == 0 || config.cpu_cores > MAX_CPU_CORES {
        return Err(WsbError::Config(format!(
            "cpu_cores must be between 1 and {}, got {}",
            MAX_CPU_CORES, config.cpu_cores
        )));
    }

    let mut guest_paths = HashSet::new();
    for folder in &config.folders {
        PathValidator::validate_host_path(&folder.host_path)
            .map_err(|reason| WsbError::Config(format!("folder mapping: {}", reason)))?;
        PathValidator::validate_guest_path(&folder.guest_path)
            .map_err(|reason| WsbError::Config(format!("folder mapping: {}", reason)))?;

        let key = folder.guest_path.trim_end_matches(&['\\', '/'][..]).to_lowercase();
        if key == AGENT_GUEST_DIR.to_lowercase() || key == CHANNEL_GUEST_DIR.to_lowercase() {
            return Err(WsbError::Config(format!(
                "guest path {} is reserved for the guest agent",
                folder.guest_path
            )));
        }
        if !guest_paths.insert(key) {
            return Err(WsbError::Config(format!(
                "guest path {} is mapped more than once",
                folder.guest_path
            )));
        }
    }

    let timeouts = &config.timeouts;
    if timeouts.startup_seconds == 0 || timeouts.exec_seconds == 0 || timeouts.shutdown_seconds == 0
    {
        return Err(WsbError::Config(
            "timeouts must be greater than zero".to_string(),
        ));
    }

    if config.monitoring.enabled && config.monitoring.interval_ms < MIN_MONITOR_INTERVAL_MS {
        return Err(WsbError::Config(format!(
            "monitoring interval must be at least {}ms",
            MIN_MONITOR_INTERVAL_MS
        )));
    }

    match config.channel.transport {
        TransportKind::SharedFolder if config.channel.poll_interval_ms == 0 => {
            return Err(WsbError::Config(
                "channel poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        TransportKind::Loopback if !config.security.networking => {
            return Err(WsbError::Config(
                "loopback transport requires security.networking = true".to_string(),
            ));
        }
        _ => {}
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(WsbError::Config("sandbox name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WsbError::Config(format!(
            "sandbox name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')))
    {
        return Err(WsbError::Config(format!(
            "sandbox name contains invalid character {:?}",
            c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FolderMapping;

    fn config() -> SandboxConfig {
        SandboxConfig {
            name: "build-env".to_string(),
            memory_mb: 2048,
            cpu_cores: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_shape_is_valid() {
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "   ", "a/b", "semi;colon"] {
            let mut c = config();
            c.name = name.to_string();
            assert!(validate_config(&c).is_err(), "accepted {:?}", name);
        }
        let mut c = config();
        c.name = "x".repeat(65);
        assert!(validate_config(&c).is_err());
    }

    #[test]
    fn test_rejects_resource_limits_out_of_range() {
        let mut c = config();
        c.memory_mb = 128;
        assert!(validate_config(&c).is_err());

        let mut c = config();
        c.cpu_cores = 0;
        assert!(validate_config(&c).is_err());
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_guest_paths() {
        let dir = tempfile::tempdir().unwrap();

        let mut c = config();
        c.folders.push(FolderMapping {
            host_path: dir.path().to_path_buf(),
            guest_path: CHANNEL_GUEST_DIR.to_string(),
            readonly: false,
        });
        assert!(validate_config(&c).is_err());

        let mut c = config();
        for _ in 0..2 {
            c.folders.push(FolderMapping {
                host_path: dir.path().to_path_buf(),
                guest_path: r"C:\work".to_string(),
                readonly: true,
            });
        }
        assert!(validate_config(&c).is_err());
    }

    #[test]
    fn test_loopback_requires_networking() {
        let mut c = config();
        c.channel.transport = TransportKind::Loopback;
        assert!(validate_config(&c).is_err());

        c.security.networking = true;
        assert!(validate_config(&c).is_ok());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let mut c = config();
        c.timeouts.shutdown_seconds = 0;
        assert!(validate_config(&c).is_err());
    }
}
