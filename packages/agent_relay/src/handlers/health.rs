use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.health())
}

/// Metrics endpoint - returns detailed relay counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
