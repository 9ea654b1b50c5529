use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Public liveness/info endpoint
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "api": "ia-gate",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// Connectivity diagnostics with a redacted config view
pub async fn debug_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.diagnostics.report().await)
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
