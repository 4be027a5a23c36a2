use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Readiness: both stores must answer a trivial query.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    let chunk_ok = sqlx::query("SELECT 1")
        .execute(state.chunk_pool.get_pool())
        .await
        .is_ok();
    let identity_ok = sqlx::query("SELECT 1")
        .execute(state.identity_pool.get_pool())
        .await
        .is_ok();

    if chunk_ok && identity_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
