use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::protocol::SessionId;
use crate::registry::SessionView;
use crate::AppState;

/// GET /health - Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /sessions/:id - Read-only membership of a live session
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<u64>,
) -> Result<Json<SessionView>, StatusCode> {
    state
        .broker
        .session_view(SessionId::new(session_id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
