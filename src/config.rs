use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{HaraftError, Result};

/// Node configuration, loaded from TOML.
///
/// ```toml
/// [raft]
/// address = "10.0.0.1:8801"
/// peers = ["10.0.0.2:8801", "10.0.0.3:8801"]
///
/// [mysql]
/// host = "127.0.0.1"
/// user = "repl_monitor"
///
/// [api]
/// address = "0.0.0.0:8080"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub raft: RaftSection,
    pub mysql: mysql::MysqlConfig,
    pub api: Option<ApiSection>,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    /// This node's RPC endpoint; doubles as its identity.
    pub address: String,
    pub peers: Vec<String>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub provider_timeout_ms: u64,
    pub quorum_loss_window_ms: Option<u64>,
}

impl Default for RaftSection {
    fn default() -> Self {
        let timers = consensus::RaftConfig::default();
        Self {
            address: String::new(),
            peers: Vec::new(),
            election_timeout_min_ms: timers.election_timeout_min_ms,
            election_timeout_max_ms: timers.election_timeout_max_ms,
            heartbeat_interval_ms: timers.heartbeat_interval_ms,
            rpc_timeout_ms: timers.rpc_timeout_ms,
            provider_timeout_ms: timers.provider_timeout_ms,
            quorum_loss_window_ms: timers.quorum_loss_window_ms,
        }
    }
}

impl RaftSection {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSection {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn new(address: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            raft: RaftSection {
                address: address.into(),
                peers,
                ..RaftSection::default()
            },
            ..Config::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HaraftError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.raft.address.trim().is_empty() {
            return Err(HaraftError::InvalidConfig("raft.address must be set".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.raft.peers {
            if *peer == self.raft.address {
                return Err(HaraftError::InvalidConfig(format!(
                    "raft.peers must not contain this node ({})",
                    peer
                )));
            }
            if !seen.insert(peer.as_str()) {
                return Err(HaraftError::InvalidConfig(format!("duplicate peer {}", peer)));
            }
        }

        consensus::RaftConfig::from(self.raft.clone()).validate()?;
        self.mysql.validate()?;

        if let Some(api) = &self.api {
            if api.address.trim().is_empty() {
                return Err(HaraftError::InvalidConfig("api.address must not be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> consensus::NodeId {
        consensus::NodeId::new(self.raft.address.clone())
    }

    pub fn peer_ids(&self) -> Vec<consensus::NodeId> {
        self.raft
            .peers
            .iter()
            .map(|peer| consensus::NodeId::new(peer.clone()))
            .collect()
    }
}

impl From<RaftSection> for consensus::RaftConfig {
    fn from(raft: RaftSection) -> Self {
        consensus::RaftConfig {
            election_timeout_min_ms: raft.election_timeout_min_ms,
            election_timeout_max_ms: raft.election_timeout_max_ms,
            heartbeat_interval_ms: raft.heartbeat_interval_ms,
            rpc_timeout_ms: raft.rpc_timeout_ms,
            provider_timeout_ms: raft.provider_timeout_ms,
            quorum_loss_window_ms: raft.quorum_loss_window_ms,
        }
    }
}
