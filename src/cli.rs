//! Operator commands that fan an RPC out to a list of nodes.
//!
//! HA controls act on one node at a time; cluster-wide effects come from
//! issuing the same request to every member.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use consensus::{NodeId, RpcRequest, RpcResponse, Transport};

use crate::error::{HaraftError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Enable,
    Disable,
    TryToLeader,
}

impl AdminAction {
    pub fn request(self) -> RpcRequest {
        match self {
            AdminAction::Enable => RpcRequest::HaEnable,
            AdminAction::Disable => RpcRequest::HaDisable,
            AdminAction::TryToLeader => RpcRequest::TryToLeader,
        }
    }
}

impl FromStr for AdminAction {
    type Err = HaraftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "enable" => Ok(AdminAction::Enable),
            "disable" => Ok(AdminAction::Disable),
            "trytoleader" | "try-to-leader" => Ok(AdminAction::TryToLeader),
            other => Err(HaraftError::InvalidConfig(format!(
                "unknown HA action '{}' (expected enable, disable or trytoleader)",
                other
            ))),
        }
    }
}

/// Parses a comma-separated `host:port` list.
pub fn parse_nodes(list: &str) -> Result<Vec<NodeId>> {
    let nodes: Vec<NodeId> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(NodeId::from)
        .collect();
    if nodes.is_empty() {
        return Err(HaraftError::InvalidConfig("no nodes given".to_string()));
    }
    Ok(nodes)
}

/// What one node answered.
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: NodeId,
    pub result: std::result::Result<RpcResponse, String>,
}

impl NodeOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(response) if response.code.is_ok())
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(response) => {
                write!(f, "{}: {} (term {}, {})", self.node, response.code, response.term, response.state)?;
                if let Some(message) = &response.message {
                    write!(f, " - {}", message)?;
                }
                if let Some(status) = response.status() {
                    let leader = status
                        .leader
                        .as_ref()
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "none".to_string());
                    write!(
                        f,
                        " leader={} ha_enabled={} replication={}",
                        leader, status.ha_enabled, status.replication
                    )?;
                }
                Ok(())
            }
            Err(e) => write!(f, "{}: unreachable - {}", self.node, e),
        }
    }
}

/// Sends `request` to every node concurrently; results keep the input order.
pub async fn fan_out(
    transport: &dyn Transport,
    nodes: &[NodeId],
    request: RpcRequest,
    timeout: Duration,
) -> Vec<NodeOutcome> {
    let calls = nodes.iter().map(|node| {
        let request = request.clone();
        async move {
            let result = match tokio::time::timeout(timeout, transport.call(node, request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no answer within {:?}", timeout)),
            };
            NodeOutcome {
                node: node.clone(),
                result,
            }
        }
    });
    futures::future::join_all(calls).await
}
