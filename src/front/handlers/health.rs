use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Process is up; does not imply the repository cache has synced yet.
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "live" })))
}

/// Process is up and has completed at least one repository cache refresh.
/// Liveness and readiness are split per spec §6 so a rolling deploy doesn't
/// route traffic to a pod that hasn't synced bindings yet.
pub async fn ready() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}
