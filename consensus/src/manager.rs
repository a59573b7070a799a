use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::provider::PositionProvider;
use crate::raft::{RaftHandle, RaftNode};
use crate::transport::Transport;
use crate::{ConsensusError, NodeId, NodeStatus, RaftConfig, Result, State};

/// Owns the task running one node's state machine.
pub struct ConsensusManager {
    node_id: NodeId,
    handle: RaftHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsensusManager {
    pub async fn new(
        node_id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn PositionProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let mut seen = HashSet::new();
        for peer in &peers {
            if *peer == node_id {
                return Err(ConsensusError::InvalidConfig(format!(
                    "peer list contains the local node {}",
                    node_id
                )));
            }
            if !seen.insert(peer) {
                return Err(ConsensusError::InvalidConfig(format!("duplicate peer {}", peer)));
            }
        }

        tracing::info!(
            "Creating consensus manager for node {} in a cluster of {}",
            node_id,
            peers.len() + 1
        );
        let (handle, task) = RaftNode::spawn(node_id.clone(), peers, config, transport, provider);

        Ok(Self {
            node_id,
            handle,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting consensus manager for node {}", self.node_id);
        self.handle.start().await
    }

    /// Stops the node and waits for its task to finish. Safe to call twice.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        tracing::info!("Shutting down consensus manager for node {}", self.node_id);

        if let Err(e) = self.handle.stop().await {
            tracing::warn!("Node {} already stopped: {}", self.node_id, e);
        }
        task.await
            .map_err(|e| ConsensusError::Task(format!("raft task for {} failed: {}", self.node_id, e)))
    }

    pub fn status(&self) -> NodeStatus {
        self.handle.status()
    }

    pub fn is_leader(&self) -> bool {
        self.handle.state() == State::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.handle.status().leader
    }
}
