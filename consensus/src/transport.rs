//! Request/response seam between cluster members.
//!
//! [`Transport`] is the client half used by a node to reach its peers;
//! [`RpcHandler`] is the server half that answers inbound requests. The
//! in-process [`MemoryNetwork`] wires both halves together without sockets
//! and can cut nodes off to simulate failures.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::messages::{RpcRequest, RpcResponse};
use crate::{ConsensusError, NodeId, Result};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` to `target` and waits for its single response.
    async fn call(&self, target: &NodeId, request: RpcRequest) -> Result<RpcResponse>;
}

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Always yields a response, even on internal faults.
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    handlers: Arc<RwLock<HashMap<NodeId, Arc<dyn RpcHandler>>>>,
    isolated: Arc<RwLock<HashSet<NodeId>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: NodeId, handler: Arc<dyn RpcHandler>) {
        tracing::debug!("Registering in-process endpoint {}", id);
        self.handlers.write().await.insert(id, handler);
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.handlers.write().await.remove(id);
    }

    /// Drops all traffic to and from `id` until [`MemoryNetwork::reconnect`].
    pub async fn isolate(&self, id: &NodeId) {
        tracing::info!("Isolating {}", id);
        self.isolated.write().await.insert(id.clone());
    }

    pub async fn reconnect(&self, id: &NodeId) {
        tracing::info!("Reconnecting {}", id);
        self.isolated.write().await.remove(id);
    }

    pub fn transport_for(&self, id: NodeId) -> MemoryTransport {
        MemoryTransport {
            local: id,
            network: self.clone(),
        }
    }
}

/// The client half of [`MemoryNetwork`] bound to one sender.
#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, target: &NodeId, request: RpcRequest) -> Result<RpcResponse> {
        {
            let isolated = self.network.isolated.read().await;
            if isolated.contains(&self.local) || isolated.contains(target) {
                return Err(ConsensusError::Network(format!(
                    "{} cannot reach {}",
                    self.local, target
                )));
            }
        }

        let handler = {
            let handlers = self.network.handlers.read().await;
            handlers
                .get(target)
                .cloned()
                .ok_or_else(|| ConsensusError::UnknownPeer(target.clone()))?
        };

        Ok(handler.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RetCode;
    use crate::State;

    struct Echo(NodeId);

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            RpcResponse::new(self.0.clone(), 1, State::Follower, RetCode::Ok)
                .with_message(request.method())
        }
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let network = MemoryNetwork::new();
        let b = NodeId::from("b");
        network.register(b.clone(), Arc::new(Echo(b.clone()))).await;

        let transport = network.transport_for(NodeId::from("a"));
        let response = transport.call(&b, RpcRequest::Ping).await.unwrap();
        assert_eq!(response.from, b);
        assert_eq!(response.message.as_deref(), Some("Ping"));
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let network = MemoryNetwork::new();
        let transport = network.transport_for(NodeId::from("a"));
        let err = transport.call(&NodeId::from("zz"), RpcRequest::Ping).await.unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn isolation_cuts_both_directions() {
        let network = MemoryNetwork::new();
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        network.register(a.clone(), Arc::new(Echo(a.clone()))).await;
        network.register(b.clone(), Arc::new(Echo(b.clone()))).await;

        network.isolate(&b).await;
        assert!(network.transport_for(a.clone()).call(&b, RpcRequest::Ping).await.is_err());
        assert!(network.transport_for(b.clone()).call(&a, RpcRequest::Ping).await.is_err());

        network.reconnect(&b).await;
        assert!(network.transport_for(a).call(&b, RpcRequest::Ping).await.is_ok());
    }
}
