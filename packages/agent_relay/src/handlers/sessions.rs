//! Engine ingestion endpoints
//!
//! The agent engine reports session lifecycle, tool executions and phase
//! changes here; every call fans out to the owner's connected clients.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use super::error_response;
use crate::AppState;
use crate::activity::ActivityState;
use crate::error::RelayError;
use crate::registry::{SessionMetadata, SessionRecord, SessionStatus};
use crate::tasks::{Task, TaskResult, TaskStart};

fn session_not_found(session_id: &str) -> (StatusCode, String) {
    error_response(RelayError::SessionNotFound(session_id.to_string()))
}

fn require_session(state: &AppState, session_id: &str) -> Result<(), (StatusCode, String)> {
    if state.relay.registry().get(session_id).is_none() {
        return Err(session_not_found(session_id));
    }
    Ok(())
}

pub async fn start_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(metadata): Json<SessionMetadata>,
) -> Result<Json<SessionRecord>, (StatusCode, String)> {
    if metadata.username.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "username is required".to_string()));
    }
    Ok(Json(state.relay.start_session(&id, metadata)))
}

/// Session terminated; keeps it listed as idle.
pub async fn end_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, (StatusCode, String)> {
    state
        .relay
        .end_session(&id)
        .map(Json)
        .ok_or_else(|| session_not_found(&id))
}

pub async fn remove_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .relay
        .remove_session(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| session_not_found(&id))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: SessionStatus,
}

pub async fn set_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<SessionRecord>, (StatusCode, String)> {
    state
        .relay
        .set_status(&id, req.status)
        .map(Json)
        .ok_or_else(|| session_not_found(&id))
}

// =============================================================================
// Tasks
// =============================================================================

pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<Task>> {
    Json(state.relay.tasks().get_session_tasks(&id))
}

pub async fn start_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(start): Json<TaskStart>,
) -> Result<Json<Task>, (StatusCode, String)> {
    require_session(&state, &id)?;
    let (task, _) = state.relay.start_task(&id, start).await;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub progress: serde_json::Value,
}

pub async fn task_progress_handler(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
    Json(req): Json<ProgressRequest>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state
        .relay
        .task_progress(&id, &task_id, req.progress)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn complete_task_handler(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
    Json(result): Json<TaskResult>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state
        .relay
        .complete_task(&id, &task_id, result)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

pub async fn fail_task_handler(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state
        .relay
        .fail_task(&id, &task_id, req.error)
        .await
        .map(Json)
        .map_err(error_response)
}

// =============================================================================
// Activity
// =============================================================================

/// A raw phase change reported by the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum ActivityRequest {
    Thinking,
    Tool {
        name: String,
        #[serde(default)]
        summary: Option<String>,
    },
    Progress {
        detail: String,
    },
    ToolComplete,
    Finish,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub state: ActivityState,
}

pub async fn activity_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActivityRequest>,
) -> Result<Json<ActivityResponse>, (StatusCode, String)> {
    let tracker = state
        .relay
        .activity(&id)
        .ok_or_else(|| session_not_found(&id))?;

    match req {
        ActivityRequest::Thinking => tracker.start_thinking(),
        ActivityRequest::Tool { name, summary } => tracker.start_tool(name, summary),
        ActivityRequest::Progress { detail } => tracker.update_tool_progress(detail),
        ActivityRequest::ToolComplete => tracker.complete_tool(),
        ActivityRequest::Finish => tracker.finish(),
    }
    state.relay.registry().touch(&id);

    Ok(Json(ActivityResponse {
        state: tracker.state(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request};
    use tower::ServiceExt;

    use crate::handlers::routes;
    use crate::test_helpers::{body_json, test_app_state, test_app_state_with_session};

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn app(state: AppState) -> Router {
        routes().with_state(state)
    }

    #[tokio::test]
    async fn test_start_session() {
        let state = test_app_state();
        let resp = app(state.clone())
            .oneshot(post_json(
                "/api/sessions/s9",
                r#"{"username":"bob","projectName":"x"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["username"], "bob");
        assert_eq!(json["status"], "streaming");
        assert!(state.relay.buffers().is_active("s9"));
    }

    #[tokio::test]
    async fn test_start_session_requires_username() {
        let resp = app(test_app_state())
            .oneshot(post_json("/api/sessions/s9", r#"{"username":"  "}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_status_unknown_session() {
        let resp = app(test_app_state())
            .oneshot(post_json("/api/sessions/ghost/status", r#"{"status":"idle"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let state = test_app_state_with_session();
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/api/sessions/s1/tasks", r#"{"title":"Bash"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["status"], "in_progress");
        let task_id = task["taskId"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/sessions/s1/tasks/{task_id}/fail"),
                r#"{"error":"exit 1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let failed = body_json(resp).await;
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["error"], "exit 1");
        assert!(failed["endTime"].is_string());

        // Finished tasks reject progress
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/sessions/s1/tasks/{task_id}/progress"),
                r#"{"progress":{"pct":10}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/s1/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let tasks = body_json(resp).await;
        assert_eq!(tasks.as_array().unwrap().len(), 1);

        assert_eq!(state.relay.buffers().buffer_len("s1"), 2);
    }

    #[tokio::test]
    async fn test_start_task_unknown_session() {
        let resp = app(test_app_state())
            .oneshot(post_json("/api/sessions/ghost/tasks", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_complete_unknown_task() {
        let resp = app(test_app_state_with_session())
            .oneshot(post_json("/api/sessions/s1/tasks/nope/complete", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activity_phases() {
        let state = test_app_state_with_session();
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/sessions/s1/activity",
                r#"{"phase":"tool","name":"Bash","summary":"$ ls"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["state"], "tool_executing");

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/sessions/s1/activity",
                r#"{"phase":"tool-complete"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["state"], "thinking");

        let resp = app
            .oneshot(post_json("/api/sessions/s1/activity", r#"{"phase":"finish"}"#))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["state"], "idle");

        let buffered = state.relay.buffers().entries("s1");
        assert_eq!(buffered.len(), 2);
        assert!(buffered[0].contains("Running Bash"));
        assert!(buffered[1].contains(r#""state":"idle""#));
    }

    #[tokio::test]
    async fn test_activity_unknown_phase_rejected() {
        let resp = app(test_app_state_with_session())
            .oneshot(post_json("/api/sessions/s1/activity", r#"{"phase":"dance"}"#))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_end_then_remove_session() {
        let state = test_app_state_with_session();
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/api/sessions/s1/end", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "idle");
        assert!(!state.relay.buffers().is_active("s1"));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sessions/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.relay.registry().is_empty());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sessions/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
