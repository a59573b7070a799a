use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use consensus::{ConsensusError, NodeId, RpcRequest, RpcResponse, Transport};

use crate::codec;
use crate::{NetworkError, Result};

/// Client side of the cluster RPC protocol.
///
/// Peers are addressed by their node id, which is their `host:port`. One
/// idle connection per peer is kept for reuse; a connection is only
/// returned to the pool after a complete request/response exchange.
pub struct TcpTransport {
    idle: Mutex<HashMap<NodeId, TcpStream>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    async fn connect(&self, target: &NodeId) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.as_str()))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to {}", target)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", target, e)))?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}", target);
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, request: &RpcRequest) -> Result<RpcResponse> {
        codec::write_frame(stream, request).await?;
        match codec::read_frame(stream).await? {
            Some(payload) => codec::decode(&payload),
            None => Err(NetworkError::ConnectionFailed(
                "connection closed before response".to_string(),
            )),
        }
    }

    async fn call_inner(&self, target: &NodeId, request: &RpcRequest) -> Result<RpcResponse> {
        let cached = self.idle.lock().await.remove(target);

        let (stream, response) = match cached {
            Some(mut stream) => match Self::exchange(&mut stream, request).await {
                Ok(response) => (stream, response),
                Err(e) => {
                    // The peer may have restarted since the connection was pooled.
                    tracing::debug!("Pooled connection to {} failed ({}), reconnecting", target, e);
                    let mut fresh = self.connect(target).await?;
                    let response = Self::exchange(&mut fresh, request).await?;
                    (fresh, response)
                }
            },
            None => {
                let mut stream = self.connect(target).await?;
                let response = Self::exchange(&mut stream, request).await?;
                (stream, response)
            }
        };

        self.idle.lock().await.insert(target.clone(), stream);
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, target: &NodeId, request: RpcRequest) -> consensus::Result<RpcResponse> {
        self.call_inner(target, &request).await.map_err(|e| {
            tracing::trace!("{} to {} failed: {}", request.method(), target, e);
            ConsensusError::from(e)
        })
    }
}
