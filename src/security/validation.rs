use std::path::Path;

/// Default upper bound for a single command line.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 8192;

/// Patterns that are never forwarded to a guest, matched case-insensitively.
const BLOCKED_PATTERNS: &[&str] = &[
    "format c:",
    "del /s /q c:\\",
    "rd /s /q c:\\",
    "rmdir /s /q c:\\",
    "remove-item -recurse -force c:\\",
    "reg delete hklm",
    "bcdedit",
    "diskpart",
    "cipher /w",
    "vssadmin delete",
];

/// Consulted before every command is sent to a guest.
///
/// A rejection is final: callers surface it as [`WsbError::Security`](crate::error::WsbError::Security)
/// and never try to sanitize the input themselves.
pub trait CommandValidator: Send + Sync {
    fn validate_command(&self, command: &str) -> Result<(), String>;
}

/// Length, control-character and deny-list checks.
#[derive(Debug, Clone)]
pub struct DefaultCommandValidator {
    max_length: usize,
    blocked: Vec<String>,
}

impl DefaultCommandValidator {
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_COMMAND_LEN,
            blocked: BLOCKED_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Add a pattern to the deny-list.
    pub fn block(mut self, pattern: impl Into<String>) -> Self {
        self.blocked.push(pattern.into().to_lowercase());
        self
    }
}

impl Default for DefaultCommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandValidator for DefaultCommandValidator {
    fn validate_command(&self, command: &str) -> Result<(), String> {
        if command.trim().is_empty() {
            return Err("command is empty".to_string());
        }

        if command.len() > self.max_length {
            return Err(format!(
                "command is {} bytes, limit is {}",
                command.len(),
                self.max_length
            ));
        }

        if command.contains('\0') {
            return Err("command contains a NUL byte".to_string());
        }

        let normalized = command
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if let Some(pattern) = self.blocked.iter().find(|p| normalized.contains(p.as_str())) {
            return Err(format!("command matches blocked pattern '{}'", pattern));
        }

        Ok(())
    }
}

/// Checks for host and guest folder paths.
pub struct PathValidator;

impl PathValidator {
    /// A host folder must be absolute and exist as a directory.
    pub fn validate_host_path(path: &Path) -> Result<(), String> {
        if !path.is_absolute() {
            return Err(format!("host path {} is not absolute", path.display()));
        }
        if !path.is_dir() {
            return Err(format!(
                "host path {} does not exist or is not a directory",
                path.display()
            ));
        }
        Ok(())
    }

    /// A guest path must be an absolute drive path (`C:\...`) without `..` segments.
    pub fn validate_guest_path(path: &str) -> Result<(), String> {
        let bytes = path.as_bytes();
        let is_drive_path = bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && matches!(bytes[2], b'\\' | b'/');
        if !is_drive_path {
            return Err(format!("guest path {} is not an absolute drive path", path));
        }

        if path.split(&['\\', '/'][..]).any(|segment| segment == "..") {
            return Err(format!("guest path {} contains '..'", path));
        }

        if path.contains(&['<', '>', '"', '|', '?', '*'][..]) {
            return Err(format!("guest path {} contains reserved characters", path));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_commands() {
        let validator = DefaultCommandValidator::new();
        assert!(validator.validate_command("echo hi").is_ok());
        assert!(validator.validate_command("dir C:\\Users").is_ok());
    }

    #[test]
    fn test_rejects_empty_and_nul() {
        let validator = DefaultCommandValidator::new();
        assert!(validator.validate_command("").is_err());
        assert!(validator.validate_command("   ").is_err());
        assert!(validator.validate_command("echo \0").is_err());
    }

    #[test]
    fn test_rejects_blocked_patterns_regardless_of_spacing() {
        let validator = DefaultCommandValidator::new();
        let err = validator.validate_command("FORMAT   C: /q").unwrap_err();
        assert!(err.contains("format c:"));

        let validator = validator.block("curl");
        assert!(validator.validate_command("curl http://x").is_err());
    }

    #[test]
    fn test_rejects_long_commands() {
        let validator = DefaultCommandValidator::new().with_max_length(8);
        assert!(validator.validate_command("echo 123456").is_err());
    }

    #[test]
    fn test_guest_paths() {
        assert!(PathValidator::validate_guest_path(r"C:\Users\WDAGUtilityAccount\Desktop").is_ok());
        assert!(PathValidator::validate_guest_path("D:/data").is_ok());
        assert!(PathValidator::validate_guest_path(r"\relative").is_err());
        assert!(PathValidator::validate_guest_path(r"C:\a\..\Windows").is_err());
        assert!(PathValidator::validate_guest_path(r"C:\a|b").is_err());
    }

    #[test]
    fn test_host_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PathValidator::validate_host_path(dir.path()).is_ok());
        assert!(PathValidator::validate_host_path(&dir.path().join("missing")).is_err());
        assert!(PathValidator::validate_host_path(Path::new("relative")).is_err());
    }
}
