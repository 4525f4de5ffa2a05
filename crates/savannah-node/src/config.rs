//! Node configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use savannah_ids::NodeId;
use savannah_snow::common::BootstrapConfig;
use savannah_snow::Parameters;
use savannah_utils::logging::LogConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node configuration, read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the node ID file
    pub data_dir: PathBuf,
    /// Overrides the ID stored under `data_dir`
    pub node_id: Option<NodeId>,
    /// How often accepted containers are gossiped, in milliseconds
    pub gossip_frequency_ms: u64,
    pub logging: LogConfig,
    /// Snow parameters shared by every chain
    pub consensus: Parameters,
    pub bootstrap: BootstrapConfig,
    pub chain: ChainConfig,
    /// Peers trusted while bootstrapping. The node itself when empty.
    pub beacons: Vec<PeerWeight>,
    /// Peers sampled by consensus. The node itself when empty.
    pub validators: Vec<PeerWeight>,
}

/// The chain run by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Hashed into the chain ID
    pub name: String,
    /// Payload of the genesis block
    pub genesis: String,
    /// How often the VM is handed new transactions, in milliseconds
    pub block_interval_ms: u64,
    /// Stop once a block at this height is accepted
    pub stop_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerWeight {
    pub node_id: NodeId,
    pub weight: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".savannah"),
            node_id: None,
            gossip_frequency_ms: 10_000,
            logging: LogConfig::default(),
            consensus: Parameters {
                k: 1,
                alpha: 1,
                beta_virtuous: 1,
                beta_rogue: 1,
                concurrent_repolls: 1,
                mixed_query_num_push_vdr: 1,
                ..Parameters::default()
            },
            bootstrap: BootstrapConfig::default(),
            chain: ChainConfig::default(),
            beacons: Vec::new(),
            validators: Vec::new(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: "dev".to_string(),
            genesis: "savannah dev chain".to_string(),
            block_interval_ms: 1_000,
            stop_height: None,
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consensus
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        self.bootstrap
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        if self.gossip_frequency_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "gossip_frequency_ms cannot be 0".to_string(),
            ));
        }
        if self.chain.name.is_empty() {
            return Err(ConfigError::MissingValue("chain.name".to_string()));
        }
        if self.chain.block_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "chain.block_interval_ms cannot be 0".to_string(),
            ));
        }
        validate_peers("beacons", &self.beacons)?;
        validate_peers("validators", &self.validators)
    }

    pub fn gossip_frequency(&self) -> Duration {
        Duration::from_millis(self.gossip_frequency_ms)
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.chain.block_interval_ms)
    }

    /// Returns the node ID file.
    pub fn node_id_path(&self) -> PathBuf {
        self.data_dir.join("node_id")
    }
}

fn validate_peers(field: &str, peers: &[PeerWeight]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for peer in peers {
        if peer.weight == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{field}: {} has zero weight",
                peer.node_id
            )));
        }
        if !seen.insert(peer.node_id) {
            return Err(ConfigError::InvalidValue(format!(
                "{field}: {} listed twice",
                peer.node_id
            )));
        }
    }
    Ok(())
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("serialize error: {0}")]
    SerializeError(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("missing value: {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use savannah_utils::logging::LogLevel;
    use tempfile::tempdir;

    fn peer(byte: u8, weight: u64) -> PeerWeight {
        PeerWeight {
            node_id: NodeId::from_slice(&[byte; 20]).unwrap(),
            weight,
        }
    }

    #[test]
    fn test_default_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NodeConfig::default();
        config.beacons = vec![peer(1, 10), peer(2, 20)];
        config.chain.stop_height = Some(5);
        config.save(&path).unwrap();

        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [chain]
            stop_height = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.chain.stop_height, Some(3));
        assert_eq!(config.chain.name, "dev");
        assert_eq!(config.consensus.k, 1);
        assert!(config.beacons.is_empty());
    }

    #[test]
    fn test_rejects_bad_peers() {
        let mut config = NodeConfig::default();
        config.beacons = vec![peer(1, 0)];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.beacons = vec![peer(1, 1), peer(1, 2)];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_rejects_bad_consensus() {
        let mut config = NodeConfig::default();
        config.consensus.alpha = 2;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            NodeConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::IoError(_))
        ));
    }
}
