use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use consensus::{ConsensusManager, PositionProvider, RaftHandle};
use network::{NetworkError, RpcServer, TcpTransport};

use crate::config::Config;
use crate::error::{HaraftError, Result};

/// One cluster member: the election state machine, its RPC endpoint and
/// the optional admin HTTP server.
pub struct Node {
    config: Config,
    consensus_manager: Arc<ConsensusManager>,
    rpc_server: RpcServer,
    api_server: Option<api::Server>,
}

impl Node {
    /// Builds a node that reads its replication position from MySQL.
    pub async fn new(config: Config) -> Result<Self> {
        let provider = Arc::new(mysql::MysqlPositionProvider::new(&config.mysql)?);
        Self::with_provider(config, provider).await
    }

    pub async fn with_provider(config: Config, provider: Arc<dyn PositionProvider>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.raft.address).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("binding {}: {}", config.raft.address, e))
        })?;
        Self::with_listener(config, listener, provider).await
    }

    /// Builds a node whose RPC endpoint is an already bound `listener`.
    /// `config.raft.address` must name the listener's address, since peers
    /// know the node by it.
    pub async fn with_listener(
        config: Config,
        listener: TcpListener,
        provider: Arc<dyn PositionProvider>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing node {} with peers {:?}", config.raft.address, config.raft.peers);

        let transport = Arc::new(TcpTransport::new(config.raft.rpc_timeout()));
        let consensus_manager = Arc::new(
            ConsensusManager::new(
                config.node_id(),
                config.peer_ids(),
                config.raft.clone().into(),
                transport,
                provider,
            )
            .await?,
        );

        let rpc_server = RpcServer::from_listener(listener, Arc::new(consensus_manager.handle()))?;

        let api_server = match &config.api {
            Some(api) => Some(api::Server::bind(&api.address, consensus_manager.handle()).await?),
            None => None,
        };

        Ok(Self {
            config,
            consensus_manager,
            rpc_server,
            api_server,
        })
    }

    pub fn handle(&self) -> RaftHandle {
        self.consensus_manager.handle()
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr> {
        Ok(self.rpc_server.local_addr()?)
    }

    pub fn api_addr(&self) -> Result<Option<SocketAddr>> {
        match &self.api_server {
            Some(server) => Ok(Some(server.local_addr()?)),
            None => Ok(None),
        }
    }

    /// Runs until `shutdown` resolves or a service fails, then stops the
    /// node and its servers.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting node services for {}", self.config.raft.address);
        self.consensus_manager.start().await?;

        let (rpc_stop, rpc_stopped) = oneshot::channel::<()>();
        let (api_stop, api_stopped) = oneshot::channel::<()>();

        let mut rpc_task = tokio::spawn(self.rpc_server.serve(async move {
            let _ = rpc_stopped.await;
        }));

        let mut api_task = match self.api_server {
            Some(server) => tokio::spawn(async move {
                server
                    .start(async move {
                        let _ = api_stopped.await;
                    })
                    .await
            }),
            None => tokio::spawn(async move {
                let _ = api_stopped.await;
                Ok::<(), api::ApiError>(())
            }),
        };

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested for {}", self.config.raft.address);
                Ok(())
            }
            result = &mut rpc_task => {
                error!("RPC server stopped: {:?}", result);
                Err(HaraftError::Task("RPC server failed".to_string()))
            }
            result = &mut api_task => {
                error!("API server stopped: {:?}", result);
                Err(HaraftError::Task("API server failed".to_string()))
            }
        };

        let _ = rpc_stop.send(());
        let _ = api_stop.send(());
        self.consensus_manager.shutdown().await?;
        if !rpc_task.is_finished() {
            let _ = rpc_task.await;
        }
        if !api_task.is_finished() {
            let _ = api_task.await;
        }

        info!("Node {} stopped", self.config.raft.address);
        outcome
    }
}
