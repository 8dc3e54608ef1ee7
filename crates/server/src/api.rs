//! REST surface: query endpoint, health, cache statistics.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use crate::auth::{bearer_token, TokenAuthenticator};
use weir_core::{Gateway, PolicyStore, QueryRequest};
use weir_error::WeirError;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub policies: Arc<PolicyStore>,
    pub auth: Arc<TokenAuthenticator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/query", post(execute_query))
        .route("/api/v1/cache/stats", get(cache_stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.gateway.cache_stats()))
}

async fn execute_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(bearer_token);

    let principal = match token {
        Some(token) => state.auth.authenticate(token).await,
        None => None,
    };
    let Some(principal) = principal else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": { "code": "UNAUTHENTICATED", "message": "missing or unknown bearer token" }
            })),
        )
            .into_response();
    };

    let policies = state.policies.resolve(&principal);
    match state.gateway.execute(request, principal, &policies).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: WeirError) -> Response {
    let status = StatusCode::from_u16(err.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = %err.code, message = %err.message, "query failed");
    }
    let trace_id = err.trace_id.clone();
    (status, Json(json!({ "error": err, "trace_id": trace_id }))).into_response()
}
