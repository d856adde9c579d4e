use crate::core::composer::{Params, RelayEndpoint};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

/// Persistent kill-switch policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Keep blocking after the VPN disconnects (strict mode)
    #[serde(default)]
    pub block_when_disconnected: bool,
    #[serde(default = "default_true")]
    pub allow_loopback: bool,
    #[serde(default = "default_true")]
    pub allow_dhcp: bool,
    #[serde(default = "default_true")]
    pub allow_ndp: bool,
    #[serde(default)]
    pub allow_lan: bool,
    /// Local networks for `allow_lan`. Empty uses the private ranges.
    #[serde(default)]
    pub lan_networks: Vec<String>,
    /// Resolvers permitted while connecting. Empty permits any resolver.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Default relay client for `--client`
    #[serde(default)]
    pub relay_client: Option<String>,
    #[serde(default)]
    pub allowed_endpoint: Option<RelayEndpoint>,
    /// Run `nft --check` before every apply
    #[serde(default = "default_true")]
    pub verify_before_commit: bool,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            block_when_disconnected: false,
            allow_loopback: true,
            allow_dhcp: true,
            allow_ndp: true,
            allow_lan: false,
            lan_networks: Vec::new(),
            dns_servers: Vec::new(),
            relay_client: None,
            allowed_endpoint: None,
            verify_before_commit: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl From<&KillSwitchConfig> for Params {
    fn from(config: &KillSwitchConfig) -> Self {
        Params {
            block_when_disconnected: config.block_when_disconnected,
            allow_loopback: config.allow_loopback,
            allow_dhcp: config.allow_dhcp,
            allow_ndp: config.allow_ndp,
            allow_lan: config.allow_lan,
            lan_networks: config.lan_networks.clone(),
            dns_servers: config.dns_servers.clone(),
            allowed_endpoint: config.allowed_endpoint.clone(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file next to `path`.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config_to(config: &KillSwitchConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    // Permissions are set at creation so the file is never world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Saves the config to the XDG data directory.
pub async fn save_config(config: &KillSwitchConfig) -> std::io::Result<()> {
    crate::utils::ensure_dirs()?;
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Data directory not found",
        )),
    }
}

/// Loads the config from `path`, or returns the default if it is missing or
/// unreadable.
pub async fn load_config_from(path: &Path) -> KillSwitchConfig {
    let Ok(json) = tokio::fs::read_to_string(path).await else {
        return KillSwitchConfig::default();
    };

    serde_json::from_str(&json).unwrap_or_else(|e| {
        warn!("Ignoring corrupt config {}: {e}", path.display());
        KillSwitchConfig::default()
    })
}

pub async fn load_config() -> KillSwitchConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => KillSwitchConfig::default(),
    }
}
