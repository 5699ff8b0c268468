// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node configuration files.
//!
//! Each node of a cluster reads one TOML file describing its own index, the
//! addresses of all nodes, and the fixed latency servers.
//!
//! # Examples
//!
//! ```
//! use netdiag::config::{NetworkMode, NodeConfig};
//!
//! let config = NodeConfig::from_toml_str(
//!     r#"
//!     id = 1
//!     network = "datagram"
//!     peers = ["127.0.0.1:4000", "127.0.0.1:4001"]
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.network, NetworkMode::Datagram);
//! assert_eq!(config.listen_address().unwrap().port(), 4001);
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PeerId;
use crate::engine::EngineConfig;

/// Error type for loading and generating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("own index {id} is not among the {peers} peers")]
    InvalidId { id: PeerId, peers: usize },
    #[error("address {0} is listed more than once")]
    DuplicatePeer(SocketAddr),
}

/// How large dissemination payloads travel over links.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Stream links, payloads are sent whole.
    #[default]
    Tcp,
    /// Datagram-style links, payloads are split into chunks.
    Datagram,
}

impl NetworkMode {
    #[must_use]
    pub const fn is_datagram(self) -> bool {
        matches!(self, Self::Datagram)
    }
}

/// Contents of one node's config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Own index into `peers`.
    pub id: PeerId,
    /// Address to listen on, defaults to the own entry of `peers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub network: NetworkMode,
    /// Addresses of all nodes, the position being the node index.
    pub peers: Vec<SocketAddr>,
    /// External servers for fixed latency vectors.
    #[serde(default)]
    pub fixed_servers: Vec<SocketAddr>,
}

impl NodeConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates a config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if parsing or validation fails.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this config into TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Checks that the own index is valid and no address repeats.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidId`] or [`ConfigError::DuplicatePeer`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id >= self.peers.len() {
            return Err(ConfigError::InvalidId {
                id: self.id,
                peers: self.peers.len(),
            });
        }
        let mut seen = HashSet::with_capacity(self.peers.len());
        for addr in &self.peers {
            if !seen.insert(addr) {
                return Err(ConfigError::DuplicatePeer(*addr));
            }
        }
        Ok(())
    }

    /// Address this node accepts connections on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidId`] if no `listen` address is set and
    /// the own index has no entry in `peers`.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(listen) = self.listen {
            return Ok(listen);
        }
        self.peers
            .get(self.id)
            .copied()
            .ok_or(ConfigError::InvalidId {
                id: self.id,
                peers: self.peers.len(),
            })
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            id: self.id,
            addresses: self.peers.clone(),
            fixed_servers: self.fixed_servers.clone(),
        }
    }
}

/// Creates one config per address for a cluster of the given nodes.
#[must_use]
pub fn generate_cluster_configs(
    addresses: &[SocketAddr],
    fixed_servers: &[SocketAddr],
    network: NetworkMode,
) -> Vec<NodeConfig> {
    (0..addresses.len())
        .map(|id| NodeConfig {
            id,
            listen: None,
            network,
            peers: addresses.to_vec(),
            fixed_servers: fixed_servers.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::localhost_ip_sockaddr;

    #[test]
    fn defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            id = 0
            peers = ["127.0.0.1:3000", "127.0.0.1:3001", "127.0.0.1:3002"]
            "#,
        )
        .unwrap();
        assert_eq!(config.network, NetworkMode::Tcp);
        assert!(config.fixed_servers.is_empty());
        assert_eq!(config.listen_address().unwrap(), localhost_ip_sockaddr(3000));
        assert_eq!(config.engine_config().addresses.len(), 3);
    }

    #[test]
    fn invalid_configs() {
        let res = NodeConfig::from_toml_str(r#"id = 2
peers = ["127.0.0.1:3000", "127.0.0.1:3001"]"#);
        assert!(matches!(res, Err(ConfigError::InvalidId { id: 2, peers: 2 })));

        let res = NodeConfig::from_toml_str(r#"id = 0
peers = ["127.0.0.1:3000", "127.0.0.1:3000"]"#);
        assert!(matches!(res, Err(ConfigError::DuplicatePeer(_))));

        let res = NodeConfig::from_toml_str(r#"id = 0
network = "carrier-pigeon"
peers = ["127.0.0.1:3000"]"#);
        assert!(matches!(res, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn listen_address_of_unvalidated_config() {
        let mut config = NodeConfig {
            id: 3,
            listen: None,
            network: NetworkMode::Tcp,
            peers: vec![localhost_ip_sockaddr(3000)],
            fixed_servers: Vec::new(),
        };
        let res = config.listen_address();
        assert!(matches!(res, Err(ConfigError::InvalidId { id: 3, peers: 1 })));

        config.listen = Some(localhost_ip_sockaddr(4000));
        assert_eq!(config.listen_address().unwrap(), localhost_ip_sockaddr(4000));
    }

    #[test]
    fn generated_configs_parse() {
        let addresses: Vec<_> = (0..4).map(|i| localhost_ip_sockaddr(5000 + i)).collect();
        let servers = [localhost_ip_sockaddr(9000)];
        let configs = generate_cluster_configs(&addresses, &servers, NetworkMode::Datagram);
        assert_eq!(configs.len(), 4);
        for (id, config) in configs.iter().enumerate() {
            let text = config.to_toml_string().unwrap();
            let parsed = NodeConfig::from_toml_str(&text).unwrap();
            assert_eq!(&parsed, config);
            assert_eq!(parsed.id, id);
            assert!(parsed.network.is_datagram());
        }
    }
}
