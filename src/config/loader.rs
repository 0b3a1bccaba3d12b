use std::path::{Path, PathBuf};

use crate::config::types::{SandboxConfig, WsbConfig};
use crate::config::validate::validate_config;
use crate::error::{Result, WsbError};

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "wsb", "wsb")
}

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".wsb").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the manager configuration, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<WsbConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(WsbConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: WsbConfig =
        toml::from_str(&content).map_err(|e| WsbError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Load and validate a sandbox configuration file.
///
/// `.json` files are parsed as JSON, everything else as TOML.
pub fn load_sandbox_config(path: &Path) -> Result<SandboxConfig> {
    if !path.exists() {
        return Err(WsbError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let config = parse_sandbox_config(&content, path)?;
    validate_config(&config)?;
    Ok(config)
}

fn parse_sandbox_config(content: &str, path: &Path) -> Result<SandboxConfig> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(content)
            .map_err(|e| WsbError::Config(format!("{}: {}", path.display(), e)))
    } else {
        toml::from_str(content).map_err(|e| WsbError::TomlParse(e.to_string()))
    }
}

/// Get the data directory holding per-sandbox work directories
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("wsb")
    }
}
