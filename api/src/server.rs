use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use consensus::RaftHandle;

use crate::handlers::*;
use crate::{ApiError, ApiResult};

pub struct Server {
    listener: TcpListener,
    app_state: Arc<AppState>,
}

impl Server {
    pub async fn bind(address: &str, node: RaftHandle) -> ApiResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", address, e)))?;

        Ok(Self {
            listener,
            app_state: Arc::new(AppState { node }),
        })
    }

    pub fn local_addr(&self) -> ApiResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ApiError::InternalError(e.to_string()))
    }

    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> ApiResult<()> {
        let addr = self.local_addr()?;
        let app = router(self.app_state);
        tracing::info!("Starting API server on {}", addr);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }
}

pub fn router(app_state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/v1/raft/status", get(raft_status))
        .route("/v1/ha/enable", post(ha_enable))
        .route("/v1/ha/disable", post(ha_disable))
        .route("/v1/ha/trytoleader", post(try_to_leader))
        .with_state(app_state);

    Router::new()
        .merge(api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .fallback(not_found)
}
