//! Configuration for the tradenet daemon.
//!
//! A single TOML file in the platform data directory. On first run a
//! default config is generated so a node can start with nothing but a
//! seed-node list edited in.

use crate::types::{AddressParseError, NodeAddress};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Platform data directory (~/.tradenet, or the config dir on Windows).
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tradenet")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tradenet")
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("bad address in config: {0}")]
    Address(#[from] AddressParseError),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "tradenet-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Our own reachable address, "host:port".
    pub listen_address: String,
    /// Well-known bootstrap addresses, "host:port" each. Read once
    /// before bootstrap begins.
    pub seed_nodes: Vec<String>,
    /// Low-priority connection ceiling; the normal and high ceilings
    /// are derived as +6 and +12.
    pub max_connections_low: usize,
    pub handshake_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "localhost:9736".to_string(),
            seed_nodes: Vec::new(),
            max_connections_low: 10,
            handshake_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Randomized retry window when the bootstrap chain is exhausted.
    pub retry_delay_min_secs: u64,
    pub retry_delay_max_secs: u64,
    /// Randomized period of the seed-node connectivity check.
    pub seed_check_min_secs: u64,
    pub seed_check_max_secs: u64,
    /// Fixed delay before re-authenticating to a seed node after the
    /// connectivity check freed headroom.
    pub seed_retry_delay_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            retry_delay_min_secs: 10,
            retry_delay_max_secs: 20,
            seed_check_min_secs: 120,
            seed_check_max_secs: 180,
            seed_retry_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the platform data directory when set.
    pub data_dir: Option<String>,
    pub save_debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            save_debounce_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load the config, generating a default file when none exists.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Config::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(&config)?)?;
        Ok(config)
    }

    pub fn own_address(&self) -> Result<NodeAddress, ConfigError> {
        Ok(self.network.listen_address.parse()?)
    }

    pub fn seed_node_addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.network
            .seed_nodes
            .iter()
            .map(|s| s.parse().map_err(ConfigError::from))
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(get_data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = Config::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(back.network.max_connections_low, 10);
        assert_eq!(back.bootstrap.retry_delay_min_secs, 10);
        assert_eq!(back.bootstrap.retry_delay_max_secs, 20);
        assert_eq!(back.storage.save_debounce_ms, 5000);
    }

    #[test]
    fn partial_config_fills_missing_sections() {
        let raw = r#"
            [network]
            listen_address = "me.onion:8000"
            seed_nodes = ["seed1.onion:8000", "seed2.onion:8000"]
            max_connections_low = 8
            handshake_timeout_secs = 30
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.own_address().unwrap(), NodeAddress::new("me.onion", 8000));
        assert_eq!(config.seed_node_addresses().unwrap().len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn bad_seed_address_is_an_error() {
        let mut config = Config::default();
        config.network.seed_nodes = vec!["noport".to_string()];
        assert!(config.seed_node_addresses().is_err());
    }
}
