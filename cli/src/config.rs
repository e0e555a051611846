// Configuration management for the PeerLink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peerlink/config.json
// - Linux: ~/.config/peerlink/config.json
// - Windows: %APPDATA%\peerlink\config.json

use anyhow::{Context, Result};
use peerlink_core::{ManagerConfig, PeerIdentity, SignalingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local identity, created by `peerlink init`
    pub identity: Option<PeerIdentity>,

    /// Relay websocket URL used by `chat`
    pub relay_url: String,

    /// Port the `relay` command listens on
    pub relay_port: u16,

    /// Storage path for contacts and history
    pub storage_path: Option<String>,

    /// Connection settings
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seconds to wait for a channel to open
    pub connection_timeout: u64,

    /// Signaling reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Seconds between heartbeats on the signaling socket
    pub heartbeat_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            relay_url: "ws://127.0.0.1:9000/ws".to_string(),
            relay_port: 9000,
            storage_path: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 15,
            max_reconnect_attempts: 5,
            heartbeat_interval: 30,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peerlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path, honoring `storage_path`
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match &self.storage_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .context("Failed to determine data directory")?
                .join("peerlink"),
        };

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// The stored identity, or an error telling the user to run `init`
    pub fn require_identity(&self) -> Result<PeerIdentity> {
        self.identity
            .clone()
            .context("No identity yet. Run `peerlink init --name <name>` first")
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            max_reconnect_attempts: self.network.max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(self.network.heartbeat_interval),
            ..SignalingConfig::new(self.relay_url.clone())
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            connect_timeout: Duration::from_secs(self.network.connection_timeout),
            ..ManagerConfig::default()
        }
    }

    /// Set a config value. Does not persist; call `save` afterwards.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay_url" => {
                if !value.starts_with("ws://") && !value.starts_with("wss://") {
                    anyhow::bail!("Relay URL must start with ws:// or wss://");
                }
                self.relay_url = value.to_string();
            }
            "relay_port" => {
                self.relay_port = value.parse().context("Invalid port number")?;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "connection_timeout" => {
                self.network.connection_timeout = value.parse().context("Invalid number")?;
            }
            "max_reconnect_attempts" => {
                self.network.max_reconnect_attempts = value.parse().context("Invalid number")?;
            }
            "heartbeat_interval" => {
                self.network.heartbeat_interval = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "relay_url" => Some(self.relay_url.clone()),
            "relay_port" => Some(self.relay_port.to_string()),
            "storage_path" => self.storage_path.clone(),
            "connection_timeout" => Some(self.network.connection_timeout.to_string()),
            "max_reconnect_attempts" => Some(self.network.max_reconnect_attempts.to_string()),
            "heartbeat_interval" => Some(self.network.heartbeat_interval.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relay_url".to_string(), self.relay_url.clone()),
            ("relay_port".to_string(), self.relay_port.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "connection_timeout".to_string(),
                format!("{}s", self.network.connection_timeout),
            ),
            (
                "max_reconnect_attempts".to_string(),
                self.network.max_reconnect_attempts.to_string(),
            ),
            (
                "heartbeat_interval".to_string(),
                format!("{}s", self.network.heartbeat_interval),
            ),
        ]
    }
}
