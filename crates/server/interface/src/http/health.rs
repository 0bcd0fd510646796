//! Liveness and readiness probes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use super::AppState;

/// The scheduler is considered stuck after this much heartbeat silence.
const HEARTBEAT_MAX_AGE: Duration = Duration::from_secs(30);

pub async fn live() -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.store_health.ping().await {
        warn!(error = %e, "Readiness: database unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "database": "unreachable" })),
        );
    }

    if state.leadership.is_leader() && !state.heartbeat.is_fresh(HEARTBEAT_MAX_AGE) {
        warn!("Readiness: scheduler heartbeat stale on the leader");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "scheduler": "stale" })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}
