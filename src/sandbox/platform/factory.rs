use std::sync::Arc;

use crate::config::{ManagerConfig, PlatformKind};
use crate::error::{Result, WsbError};

use super::{IsolationPlatform, LocalProcessPlatform, WindowsSandboxPlatform};

/// Create the isolation platform selected by the manager configuration.
pub fn create_platform(config: &ManagerConfig) -> Result<Arc<dyn IsolationPlatform>> {
    let kind = resolve_platform_kind(config)?;

    match kind {
        PlatformKind::Windows => Ok(Arc::new(WindowsSandboxPlatform::new(
            config.sandbox_executable.as_deref(),
        )?)),
        PlatformKind::Local => Ok(Arc::new(LocalProcessPlatform::new())),
        PlatformKind::Auto => Err(WsbError::Platform(
            "Platform 'auto' was not resolved".to_string(),
        )),
    }
}

/// Resolve the platform kind, handling Auto selection.
pub fn resolve_platform_kind(config: &ManagerConfig) -> Result<PlatformKind> {
    let windows_available =
        WindowsSandboxPlatform::is_available(config.sandbox_executable.as_deref());

    match config.platform {
        // Priority: Windows Sandbox > local process
        PlatformKind::Auto if windows_available => Ok(PlatformKind::Windows),
        PlatformKind::Auto => Ok(PlatformKind::Local),
        PlatformKind::Windows if !windows_available => Err(WsbError::PlatformUnavailable {
            platform: "windows".to_string(),
            reason: windows_unavailable_reason().to_string(),
        }),
        ref other => Ok(other.clone()),
    }
}

fn windows_unavailable_reason() -> &'static str {
    if cfg!(windows) {
        "WindowsSandbox.exe not found. Enable the 'Windows Sandbox' optional feature (Pro/Enterprise editions)"
    } else {
        "Windows Sandbox is only available on Windows"
    }
}

/// Get information about available platforms on this system.
pub fn available_platforms(config: &ManagerConfig) -> Vec<PlatformInfo> {
    let windows_available =
        WindowsSandboxPlatform::is_available(config.sandbox_executable.as_deref());

    vec![
        PlatformInfo {
            name: "windows",
            available: windows_available,
            description: "Windows Sandbox (Hyper-V isolated, disposable)",
            unavailable_reason: (!windows_available).then(windows_unavailable_reason),
        },
        PlatformInfo {
            name: "local",
            available: true,
            description: "Guest agent as a host process (no isolation, development only)",
            unavailable_reason: None,
        },
    ]
}

/// Information about an isolation platform.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlatformInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_is_always_available() {
        let platforms = available_platforms(&ManagerConfig::default());
        let local = platforms.iter().find(|p| p.name == "local").unwrap();
        assert!(local.available);
        assert!(local.unavailable_reason.is_none());
    }

    #[test]
    fn test_explicit_local_platform() {
        let config = ManagerConfig {
            platform: PlatformKind::Local,
            ..Default::default()
        };
        assert_eq!(resolve_platform_kind(&config).unwrap(), PlatformKind::Local);
        assert_eq!(create_platform(&config).unwrap().name(), "local");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_auto_falls_back_to_local_off_windows() {
        let config = ManagerConfig::default();
        assert_eq!(resolve_platform_kind(&config).unwrap(), PlatformKind::Local);

        let config = ManagerConfig {
            platform: PlatformKind::Windows,
            ..Default::default()
        };
        assert!(matches!(
            resolve_platform_kind(&config),
            Err(WsbError::PlatformUnavailable { .. })
        ));
    }
}
