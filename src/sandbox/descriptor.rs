use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::config::{FolderMapping, SandboxConfig};
use crate::sandbox::channel::GuestChannelSetup;

/// Guest folder the agent binaries are mapped to (read-only).
pub const AGENT_GUEST_DIR: &str = r"C:\wsb\agent";

/// Guest folder used by the shared-folder transport.
pub const CHANNEL_GUEST_DIR: &str = r"C:\wsb\channel";

/// File name of the guest agent inside [`AGENT_GUEST_DIR`].
pub const AGENT_EXECUTABLE: &str = "wsb-agent.exe";

/// Declarative description of a session, consumed by the isolation platform.
#[derive(Debug, Clone)]
pub struct IsolationDescriptor {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub networking: bool,
    pub vgpu: bool,
    /// User folders followed by the agent and channel folders
    pub mapped_folders: Vec<FolderMapping>,
    /// Guest path of the agent executable
    pub agent_program: String,
    pub agent_args: Vec<String>,
    /// User command run at logon before the agent starts
    pub user_logon_command: Option<String>,
}

impl IsolationDescriptor {
    pub fn build(config: &SandboxConfig, channel: &GuestChannelSetup, agent_dir: &Path) -> Self {
        let mut mapped_folders = config.folders.clone();
        mapped_folders.push(FolderMapping {
            host_path: agent_dir.to_path_buf(),
            guest_path: AGENT_GUEST_DIR.to_string(),
            readonly: true,
        });
        mapped_folders.extend(channel.folders.iter().cloned());

        Self {
            memory_mb: config.memory_mb,
            cpu_cores: config.cpu_cores,
            networking: config.security.networking,
            vgpu: config.security.vgpu,
            mapped_folders,
            agent_program: format!(r"{}\{}", AGENT_GUEST_DIR, AGENT_EXECUTABLE),
            agent_args: channel.agent_args.clone(),
            user_logon_command: config.security.logon_command.clone(),
        }
    }

    /// The command line run at guest logon: the user's command (if any), then the agent.
    pub fn logon_command(&self) -> String {
        let mut agent = quote_arg(&self.agent_program);
        for arg in &self.agent_args {
            agent.push(' ');
            agent.push_str(&quote_arg(arg));
        }

        match self.user_logon_command.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => format!("cmd.exe /c {} & {}", user, agent),
            _ => agent,
        }
    }

    /// Render as a Windows Sandbox `.wsb` document.
    ///
    /// The `.wsb` schema has no CPU element, so `cpu_cores` is not emitted.
    pub fn to_wsb_xml(&self) -> String {
        let mut xml = String::from("<Configuration>\n");
        let toggle = |on: bool| if on { "Enable" } else { "Disable" };

        let _ = writeln!(xml, "  <VGpu>{}</VGpu>", toggle(self.vgpu));
        let _ = writeln!(xml, "  <Networking>{}</Networking>", toggle(self.networking));
        let _ = writeln!(xml, "  <MemoryInMB>{}</MemoryInMB>", self.memory_mb);

        if !self.mapped_folders.is_empty() {
            xml.push_str("  <MappedFolders>\n");
            for folder in &self.mapped_folders {
                xml.push_str("    <MappedFolder>\n");
                let _ = writeln!(
                    xml,
                    "      <HostFolder>{}</HostFolder>",
                    escape_xml(&folder.host_path.display().to_string())
                );
                let _ = writeln!(
                    xml,
                    "      <SandboxFolder>{}</SandboxFolder>",
                    escape_xml(&folder.guest_path)
                );
                let _ = writeln!(xml, "      <ReadOnly>{}</ReadOnly>", folder.readonly);
                xml.push_str("    </MappedFolder>\n");
            }
            xml.push_str("  </MappedFolders>\n");
        }

        xml.push_str("  <LogonCommand>\n");
        let _ = writeln!(
            xml,
            "    <Command>{}</Command>",
            escape_xml(&self.logon_command())
        );
        xml.push_str("  </LogonCommand>\n");
        xml.push_str("</Configuration>\n");
        xml
    }

    /// Map a guest path back to the host path behind it, if it lies in a mapped folder.
    pub fn resolve_guest_path(&self, guest: &str) -> Option<PathBuf> {
        let guest = guest.replace('/', "\\");
        let lower = guest.to_lowercase();

        self.mapped_folders.iter().find_map(|folder| {
            let prefix = folder.guest_path.replace('/', "\\");
            let prefix = prefix.trim_end_matches('\\').to_lowercase();

            if lower == prefix {
                return Some(folder.host_path.clone());
            }
            let rest = lower.strip_prefix(&prefix)?.strip_prefix('\\')?;
            // Keep the original casing of the remainder.
            let rest = &guest[guest.len() - rest.len()..];
            Some(
                rest.split('\\')
                    .filter(|s| !s.is_empty())
                    .fold(folder.host_path.clone(), |path, part| path.join(part)),
            )
        })
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains([' ', '\t', '&', '^', '|']) {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(logon: Option<&str>) -> IsolationDescriptor {
        let config = SandboxConfig {
            name: "build-env".to_string(),
            memory_mb: 2048,
            cpu_cores: 2,
            folders: vec![FolderMapping {
                host_path: PathBuf::from("/srv/src & co"),
                guest_path: r"C:\Users\WDAGUtilityAccount\Desktop\src".to_string(),
                readonly: true,
            }],
            security: crate::config::SecurityConfig {
                networking: false,
                vgpu: true,
                logon_command: logon.map(str::to_string),
            },
            ..Default::default()
        };
        let channel = GuestChannelSetup {
            folders: vec![FolderMapping {
                host_path: PathBuf::from("/var/wsb/1234/channel"),
                guest_path: CHANNEL_GUEST_DIR.to_string(),
                readonly: false,
            }],
            agent_args: vec!["--channel-dir".to_string(), CHANNEL_GUEST_DIR.to_string()],
        };
        IsolationDescriptor::build(&config, &channel, Path::new("/opt/wsb"))
    }

    #[test]
    fn test_wsb_xml_contents() {
        let xml = descriptor(None).to_wsb_xml();
        assert!(xml.starts_with("<Configuration>"));
        assert!(xml.contains("<MemoryInMB>2048</MemoryInMB>"));
        assert!(xml.contains("<Networking>Disable</Networking>"));
        assert!(xml.contains("<VGpu>Enable</VGpu>"));
        assert!(xml.contains("<HostFolder>/srv/src &amp; co</HostFolder>"));
        assert!(xml.contains(r"<SandboxFolder>C:\wsb\agent</SandboxFolder>"));
        assert_eq!(xml.matches("<MappedFolder>").count(), 3);
        assert!(xml.contains(
            r"<Command>C:\wsb\agent\wsb-agent.exe --channel-dir C:\wsb\channel</Command>"
        ));
    }

    #[test]
    fn test_user_logon_command_runs_before_agent() {
        let command = descriptor(Some("winget install git")).logon_command();
        assert_eq!(
            command,
            r"cmd.exe /c winget install git & C:\wsb\agent\wsb-agent.exe --channel-dir C:\wsb\channel"
        );
    }

    #[test]
    fn test_resolve_guest_path() {
        let d = descriptor(None);
        assert_eq!(
            d.resolve_guest_path(r"c:\WSB\agent\wsb-agent.exe"),
            Some(PathBuf::from("/opt/wsb/wsb-agent.exe"))
        );
        assert_eq!(
            d.resolve_guest_path(CHANNEL_GUEST_DIR),
            Some(PathBuf::from("/var/wsb/1234/channel"))
        );
        assert_eq!(d.resolve_guest_path(r"C:\wsb\agentx"), None);
        assert_eq!(d.resolve_guest_path(r"D:\elsewhere"), None);
    }
}
