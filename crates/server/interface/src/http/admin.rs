//! Admin surface: manual panic trigger and migration control, gated by the
//! admin key header. The trigger exists for staging smoke tests.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use vigil_server_domain::shared_kernel::UserId;

use crate::auth::secret_token_matches;
use crate::http::AppState;

const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    secret_token_matches(provided, &state.admin_key)
}

#[derive(Debug, Deserialize)]
pub struct TriggerPanicRequest {
    pub traveler_id: Uuid,
}

pub async fn trigger_panic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TriggerPanicRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }
    if !state.feature_panic {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "panic feature disabled" })),
        );
    }

    let traveler_id = UserId(request.traveler_id);
    match state.users.find_by_id(traveler_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "traveler not found" })),
            )
        }
        Err(e) => {
            error!(error = %e, "Admin trigger lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "lookup failed" })),
            );
        }
    }

    match state.dispatcher.trigger_panic(traveler_id).await {
        Ok((incident, created)) => {
            info!(
                incident_id = %incident.id,
                created,
                "Admin panic trigger"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "incident_id": incident.id,
                    "created": created,
                })),
            )
        }
        Err(e) => {
            error!(error = %e, "Admin panic trigger failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

pub async fn migrations_apply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }

    match state.migrations.apply().await {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))),
        Err(e) => {
            error!(error = %e, "Migration apply failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

pub async fn migrations_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }

    match state.migrations.status().await {
        Ok(status) => (StatusCode::OK, Json(json!(status))),
        Err(e) => {
            error!(error = %e, "Migration status failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
