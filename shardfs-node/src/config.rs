//! Configuration management for a shardfs node
//!
//! Supports loading from TOML files and environment variables.

use serde::{Deserialize, Serialize};
use shardfs_core::crypto::{generate_id, EncryptionKey};
use shardfs_network::TransportConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeIdentity,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkSettings,

    /// Shared cluster secret
    #[serde(default)]
    pub security: SecuritySettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = ?path, "No config file, using defaults");
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage.data_dir.exists() {
            std::fs::create_dir_all(&self.storage.data_dir).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create data directory {:?}: {}",
                    self.storage.data_dir, e
                ))
            })?;
        }

        self.network.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ConfigError::ValidationError(format!(
                "Invalid listen address {:?}: {}",
                self.network.listen_addr, e
            ))
        })?;

        if self.network.dial_timeout_secs == 0 || self.network.stream_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Timeouts must be at least one second".to_string(),
            ));
        }

        if self.network.inbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "inbound_buffer cannot be 0".to_string(),
            ));
        }

        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "Node id cannot be empty".to_string(),
            ));
        }

        self.security.key()?;
        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        node_id: Option<String>,
        data_dir: Option<PathBuf>,
        listen_addr: Option<String>,
        bootstrap_peers: Option<Vec<String>>,
    ) -> Self {
        if let Some(id) = node_id {
            self.node.id = id;
        }
        if let Some(dir) = data_dir {
            self.storage.data_dir = dir;
        }
        if let Some(addr) = listen_addr {
            self.network.listen_addr = addr;
        }
        if let Some(peers) = bootstrap_peers {
            self.network.bootstrap_peers = peers;
        }
        self
    }

    /// Override config with environment variables
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(id) = std::env::var("SHARDFS_NODE_ID") {
            self.node.id = id;
        }
        if let Ok(dir) = std::env::var("SHARDFS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("SHARDFS_LISTEN_ADDR") {
            self.network.listen_addr = addr;
        }
        if let Ok(peers) = std::env::var("SHARDFS_BOOTSTRAP") {
            self.network.bootstrap_peers = split_peer_list(&peers);
        }
        if let Ok(key) = std::env::var("SHARDFS_ENCRYPTION_KEY") {
            self.security.encryption_key = Some(key);
        }
        self
    }
}

/// Split a comma separated peer list, dropping empty entries
pub fn split_peer_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Node id; namespaces this node's own objects on disk
    #[serde(default = "generate_id")]
    pub id: String,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self { id: generate_id() }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageSettings {
    /// Convert to storage crate config
    pub fn to_storage_config(&self) -> shardfs_storage::StorageConfig {
        shardfs_storage::StorageConfig::new(&self.data_dir)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./shardfs_data")
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peers to dial on startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Stream claim and peer I/O deadline in seconds
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    /// Inbound control message queue capacity
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            dial_timeout_secs: default_dial_timeout(),
            stream_timeout_secs: default_stream_timeout(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl NetworkSettings {
    /// Convert to network crate config
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_addr: self.listen_addr.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            stream_timeout: Duration::from_secs(self.stream_timeout_secs),
            inbound_buffer: self.inbound_buffer,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_stream_timeout() -> u64 {
    30
}

fn default_inbound_buffer() -> usize {
    1024
}

/// Cluster secret configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Hex-encoded 32 byte key shared by every node of the cluster.
    /// A random key is generated when unset, which only suits a single node.
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
}

impl SecuritySettings {
    /// Parse the configured key, or generate a fresh one
    pub fn key(&self) -> Result<EncryptionKey, ConfigError> {
        match &self.encryption_key {
            Some(hex) => EncryptionKey::from_hex(hex.trim()).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid encryption key: {}", e))
            }),
            None => Ok(EncryptionKey::generate()),
        }
    }
}
