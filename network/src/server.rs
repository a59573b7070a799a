use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use consensus::{NodeId, RpcHandler, RpcRequest, RpcResponse};

use crate::codec;
use crate::{NetworkError, Result};

/// Accepts peer connections and answers each framed request with exactly
/// one framed response, in order, on the same connection.
pub struct RpcServer {
    id: NodeId,
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub async fn bind(address: &str, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("binding {}: {}", address, e)))?;
        Self::from_listener(listener, handler)
    }

    /// Serves on a listener the caller already bound.
    pub fn from_listener(listener: TcpListener, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        let id = NodeId::new(listener.local_addr()?.to_string());
        tracing::info!("RPC server listening on {}", id);

        Ok(Self {
            id,
            listener,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("RPC server on {} shutting down", self.id);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted RPC connection from {}", peer);
                        let id = self.id.clone();
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(id, stream, handler).await {
                                tracing::debug!("RPC connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept RPC connection: {}", e),
                },
            }
        }
    }
}

async fn serve_connection(id: NodeId, mut stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<()> {
    stream.set_nodelay(true)?;

    while let Some(payload) = codec::read_frame(&mut stream).await? {
        let response = match codec::decode::<RpcRequest>(&payload) {
            Ok(request) => handler.handle(request).await,
            Err(e) => {
                tracing::warn!("Malformed RPC request on {}: {}", id, e);
                RpcResponse::fault(id.clone(), format!("malformed request: {}", e))
            }
        };
        codec::write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TcpTransport;
    use async_trait::async_trait;
    use consensus::{RetCode, State, Transport};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Fixed;

    #[async_trait]
    impl RpcHandler for Fixed {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            RpcResponse::new(NodeId::from("fixed"), 9, State::Follower, RetCode::Ok)
                .with_message(request.method())
        }
    }

    async fn spawn_server() -> (NodeId, tokio::sync::oneshot::Sender<()>) {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(Fixed)).await.unwrap();
        let address = NodeId::new(server.local_addr().unwrap().to_string());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.serve(async move {
            let _ = stop_rx.await;
        }));
        (address, stop_tx)
    }

    #[tokio::test]
    async fn transport_round_trips_over_tcp() {
        let (address, _stop) = spawn_server().await;
        let transport = TcpTransport::new(Duration::from_millis(500));

        for request in [RpcRequest::Ping, RpcRequest::HaEnable, RpcRequest::Status] {
            let method = request.method();
            let response = transport.call(&address, request).await.unwrap();
            assert_eq!(response.term, 9);
            assert_eq!(response.message.as_deref(), Some(method));
        }
    }

    #[tokio::test]
    async fn malformed_request_gets_a_fault() {
        let (address, _stop) = spawn_server().await;
        let mut stream = TcpStream::connect(address.as_str()).await.unwrap();
        let garbage = b"not json";
        stream.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(garbage).await.unwrap();

        let payload = codec::read_frame(&mut stream).await.unwrap().unwrap();
        let response: RpcResponse = codec::decode(&payload).unwrap();
        assert_eq!(response.code, RetCode::Internal);
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = NodeId::new(listener.local_addr().unwrap().to_string());
        drop(listener);

        let transport = TcpTransport::new(Duration::from_millis(200));
        let err = transport.call(&address, RpcRequest::Ping).await.unwrap_err();
        assert!(matches!(err, consensus::ConsensusError::Network(_)));
    }
}
