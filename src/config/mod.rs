pub mod loader;
pub mod types;
pub mod validate;

pub use loader::{get_config_path, get_data_dir, load_config, load_sandbox_config};
pub use types::{
    ChannelConfig, FolderMapping, ManagerConfig, MonitoringConfig, PlatformKind, SandboxConfig,
    SecurityConfig, TimeoutConfig, TransportKind, WsbConfig,
};
pub use validate::validate_config;
