mod gtid;
mod ha;
mod manager;
mod messages;
mod raft;
pub mod provider;
pub mod transport;

pub use gtid::{check_transfer, check_vote, compare, GtidOrdering, GtidPosition, ReplicationView};
pub use manager::ConsensusManager;
pub use messages::{HeartbeatRequest, ResponseDetail, RetCode, RpcRequest, RpcResponse, VoteRequest};
pub use provider::{PositionProvider, ProviderError};
pub use raft::RaftHandle;
pub use transport::{MemoryNetwork, MemoryTransport, RpcHandler, Transport};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A cluster member, identified by the address its RPC endpoint listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Idle,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "IDLE",
            State::Follower => "FOLLOWER",
            State::Candidate => "CANDIDATE",
            State::Leader => "LEADER",
        };
        f.write_str(name)
    }
}

/// Timer and timeout policy for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat period; must stay well below the minimum election timeout.
    pub heartbeat_interval_ms: u64,
    /// Per-call deadline for outbound vote, heartbeat and ping RPCs.
    pub rpc_timeout_ms: u64,
    /// Deadline for one replication position lookup.
    pub provider_timeout_ms: u64,
    /// How long a leader tolerates missing a quorum of heartbeat acks.
    /// Defaults to the maximum election timeout.
    pub quorum_loss_window_ms: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_interval_ms: 300,
            rpc_timeout_ms: 500,
            provider_timeout_ms: 250,
            quorum_loss_window_ms: None,
        }
    }
}

impl RaftConfig {
    /// Short timers for in-process clusters.
    pub fn for_testing() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 30,
            rpc_timeout_ms: 60,
            provider_timeout_ms: 25,
            quorum_loss_window_ms: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "election_timeout_min_ms must be positive".to_string(),
            ));
        }
        if self.election_timeout_max_ms <= self.election_timeout_min_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "election_timeout_max_ms ({}) must exceed election_timeout_min_ms ({})",
                self.election_timeout_max_ms, self.election_timeout_min_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be positive and below election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.rpc_timeout_ms == 0 || self.provider_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "rpc_timeout_ms and provider_timeout_ms must be positive".to_string(),
            ));
        }
        // Lookups made on the node task must not outlast one heartbeat period.
        if self.provider_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "provider_timeout_ms ({}) must be below heartbeat_interval_ms ({})",
                self.provider_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn random_election_timeout(&self) -> Duration {
        let timeout_ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(timeout_ms)
    }

    pub fn max_election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn quorum_loss_window(&self) -> Duration {
        Duration::from_millis(self.quorum_loss_window_ms.unwrap_or(self.election_timeout_max_ms))
    }

    /// Strict majority of `total_nodes`.
    pub fn quorum_size(&self, total_nodes: usize) -> usize {
        total_nodes / 2 + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub elections_started: u64,
    pub elections_won: u64,
    pub votes_granted: u64,
    pub votes_denied: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub step_downs: u64,
}

/// Point-in-time view of a node, published after every processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: State,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub ha_enabled: bool,
    pub started: bool,
    pub peers: Vec<NodeId>,
    pub replication: ReplicationView,
    pub counters: Counters,
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC to {0} timed out")]
    Timeout(NodeId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Node {0} is stopped")]
    Stopped(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
