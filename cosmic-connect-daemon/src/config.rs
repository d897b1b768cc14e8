//! Daemon Configuration
//!
//! TOML configuration for the COSMIC Connect daemon, loaded from the
//! user config directory (default
//! `~/.config/cosmic-connect/config.toml`) and created with defaults on
//! first run. The generated device id is written back so the identity
//! stays stable across restarts.

use anyhow::{Context, Result};
use cosmic_connect_protocol::discovery::generate_device_id;
use cosmic_connect_protocol::policy::NetworkPolicyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    /// Trusted-network policy
    #[serde(default)]
    pub policy: NetworkPolicyConfig,

    #[serde(default)]
    pub plugins: PluginConfig,

    #[serde(default)]
    pub paths: PathConfig,
}

/// Device identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name shown to peers (1-32 characters)
    pub name: String,

    /// desktop, laptop, phone, tablet or tv
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Stable device id; generated and persisted on first run
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Preferred TCP listen port (walks forward when taken)
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Seconds between identity broadcasts
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// Disable UDP discovery entirely (manual connections only)
    #[serde(default)]
    pub disable_discovery: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            broadcast_interval_secs: default_broadcast_interval(),
            disable_discovery: false,
        }
    }
}

/// Plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin keys to disable
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Accept pairing requests without asking (test setups only)
    #[serde(default)]
    pub auto_accept_pairing: bool,
}

/// Storage paths
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathConfig {
    /// Where keys and the device registry live; defaults to the user
    /// config directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Where received files land; defaults to the user download
    /// directory
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

fn default_device_type() -> String {
    "desktop".to_string()
}

fn default_tcp_port() -> u16 {
    cosmic_connect_protocol::DISCOVERY_PORT + 1
}

fn default_broadcast_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        let name = hostname().unwrap_or_else(|| "COSMIC Device".to_string());
        Self {
            device: DeviceConfig {
                name,
                device_type: default_device_type(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            policy: NetworkPolicyConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("no user config directory")?;
        Ok(dir.join("cosmic-connect").join("config.toml"))
    }

    /// Load the configuration, creating it with defaults when missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: Config = toml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            info!("Created default configuration at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(path, text).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// The stable device id, generating and persisting one on first use
    pub fn device_id(&mut self, config_path: &Path) -> Result<String> {
        if let Some(id) = &self.device.device_id {
            return Ok(id.clone());
        }

        let id = generate_device_id();
        self.device.device_id = Some(id.clone());
        self.save(config_path)?;
        info!(device_id = %id, "Generated device id");
        Ok(id)
    }

    /// Directory for keys and the device registry
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.paths.data_dir {
            return Ok(dir.clone());
        }
        let dir = dirs::config_dir().context("no user config directory")?;
        Ok(dir.join("cosmic-connect"))
    }

    /// Directory received files land in
    pub fn download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.download_dir {
            return dir.clone();
        }
        dirs::download_dir().unwrap_or_else(std::env::temp_dir)
    }
}

fn hostname() -> Option<String> {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.len() <= 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.network.tcp_port, default_tcp_port());

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.device.name, created.device.name);
    }

    #[test]
    fn test_device_id_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_or_create(&path).unwrap();
        let id = config.device_id(&path).unwrap();
        assert!(!id.is_empty());

        // Regenerating from disk yields the same id.
        let mut reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.device_id(&path).unwrap(), id);
    }

    #[test]
    fn test_partial_config_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[device]\nname = \"My Laptop\"\n").unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.device.name, "My Laptop");
        assert_eq!(config.device.device_type, "desktop");
        assert!(config.policy.trust_all_networks);
    }
}
