//! Configuration file support for the Tally node.
//!
//! Loads optional `tally.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.
//! Consensus parameters are not configured here: they live in the genesis
//! file because every node must agree on them.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Name of the node configuration file inside the data directory.
pub const CONFIG_FILE: &str = "tally.toml";

/// Default genesis file name inside the data directory.
pub const GENESIS_FILE: &str = "genesis.toml";

/// Configuration errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid address {0}")]
    InvalidAddress(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub node: NodeConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub p2p_host: String,
    pub p2p_port: u16,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    /// Propose and approve blocks when this node's key is on the committee.
    pub validator: bool,
    /// Genesis file; relative paths are resolved against the data directory.
    pub genesis_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            p2p_host: "0.0.0.0".into(),
            p2p_port: crate::constants::DEFAULT_P2P_PORT,
            rpc_host: "127.0.0.1".into(),
            rpc_port: crate::constants::DEFAULT_RPC_PORT,
            bootstrap_peers: vec![],
            max_peers: crate::constants::MAX_PEERS,
            validator: false,
            genesis_path: None,
        }
    }
}

impl TallyConfig {
    /// Load configuration from `tally.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist or cannot be parsed.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Self::default();
        }
        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!(path = %config_path.display(), "loaded config");
                config
            }
            Err(e) => {
                tracing::warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Parse a configuration file, failing on any error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn p2p_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.node.p2p_host, self.node.p2p_port)
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.node.rpc_host, self.node.rpc_port)
    }

    /// Parse bootstrap peers into socket addresses, skipping invalid entries.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(peer = %s, "ignoring invalid bootstrap peer");
                    None
                }
            })
            .collect()
    }

    /// Where to read the genesis file from.
    pub fn genesis_path(&self, data_dir: &Path) -> PathBuf {
        match &self.node.genesis_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join(GENESIS_FILE),
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let text = format!("{}:{}", host, port);
    text.parse().map_err(|_| ConfigError::InvalidAddress(text))
}
