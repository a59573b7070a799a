use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use consensus::{RaftHandle, RetCode, RpcRequest};

use crate::{ApiError, ApiResult};

pub struct AppState {
    pub node: RaftHandle,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let status = state.node.status();

    let health_info = serde_json::json!({
        "status": "healthy",
        "node": status.id,
        "state": status.state,
        "term": status.term,
        "leader": status.leader,
    });

    Ok((StatusCode::OK, Json(health_info)).into_response())
}

pub async fn raft_status(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let response = state
        .node
        .call(RpcRequest::Status)
        .await
        .map_err(|e| ApiError::Consensus(e.to_string()))?;

    match response.status() {
        Some(status) => Ok((StatusCode::OK, Json(status.clone())).into_response()),
        None => Err(ApiError::InternalError(format!(
            "status request answered {}",
            response.code
        ))),
    }
}

pub async fn ha_enable(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    admin_call(&state, RpcRequest::HaEnable).await
}

pub async fn ha_disable(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    admin_call(&state, RpcRequest::HaDisable).await
}

pub async fn try_to_leader(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    admin_call(&state, RpcRequest::TryToLeader).await
}

pub async fn not_found() -> ApiResult<Response> {
    Err(ApiError::NotFound("no such endpoint".to_string()))
}

/// Forwards an admin request to the node. Rejections are conflicts, not
/// failures; only faults inside the node map to 503.
async fn admin_call(state: &AppState, request: RpcRequest) -> ApiResult<Response> {
    let method = request.method();
    let response = state
        .node
        .call(request)
        .await
        .map_err(|e| ApiError::Consensus(e.to_string()))?;

    tracing::info!("{} on {} answered {}", method, response.from, response.code);

    let status = match response.code {
        RetCode::Ok => StatusCode::OK,
        RetCode::Internal => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::CONFLICT,
    };
    Ok((status, Json(response)).into_response())
}
