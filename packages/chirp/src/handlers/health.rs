use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    let status = if state.conduit.is_closed() {
        "closed"
    } else if metrics.errors.feed == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        connections: state.conduit.pool_size().await as u64,
        stashed: state.conduit.stash_len().await as u64,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 while the conduit is open and the store answers
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = match &state.db {
        Some(db) => db.is_reachable().await,
        None => true,
    };
    let open = !state.conduit.is_closed();

    if db_ok && open {
        Json(serde_json::json!({
            "status": "ready",
            "database": if state.db.is_some() { "connected" } else { "disabled" }
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "conduit": if open { "open" } else { "closed" },
                "database": if db_ok { "connected" } else { "disconnected" }
            })),
        )
            .into_response()
    }
}
