pub mod health;
pub mod sessions;
pub mod stream;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};

use crate::AppState;
use crate::error::RelayError;

// Re-export all handlers for easy route registration
pub use health::{health_handler, metrics_handler};
pub use sessions::{
    activity_handler, complete_task_handler, end_session_handler, fail_task_handler,
    list_tasks_handler, remove_session_handler, set_status_handler, start_session_handler,
    start_task_handler, task_progress_handler,
};
pub use stream::{events_handler, replay_handler, websocket_handler};

/// All relay routes, without middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        // Client streams
        .route("/api/users/{user}/events", get(events_handler))
        .route("/api/users/{user}/ws", get(websocket_handler))
        .route("/api/sessions/{id}/replay", get(replay_handler))
        // Engine ingestion
        .route(
            "/api/sessions/{id}",
            post(start_session_handler).delete(remove_session_handler),
        )
        .route("/api/sessions/{id}/end", post(end_session_handler))
        .route("/api/sessions/{id}/status", post(set_status_handler))
        .route(
            "/api/sessions/{id}/tasks",
            get(list_tasks_handler).post(start_task_handler),
        )
        .route(
            "/api/sessions/{id}/tasks/{task_id}/progress",
            post(task_progress_handler),
        )
        .route(
            "/api/sessions/{id}/tasks/{task_id}/complete",
            post(complete_task_handler),
        )
        .route(
            "/api/sessions/{id}/tasks/{task_id}/fail",
            post(fail_task_handler),
        )
        .route("/api/sessions/{id}/activity", post(activity_handler))
        // Health endpoints
        .route("/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
}

/// Map a relay error onto the `(StatusCode, String)` handlers return.
pub(crate) fn error_response(e: RelayError) -> (StatusCode, String) {
    let status = match &e {
        RelayError::SessionNotFound(_) | RelayError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        RelayError::Serialize(_) | RelayError::Channel(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
