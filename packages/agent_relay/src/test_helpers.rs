use std::time::Duration;

use crate::AppState;
use crate::config::RelayConfig;
use crate::registry::SessionMetadata;

/// Build an `AppState` with default limits and a short client queue.
pub fn test_app_state() -> AppState {
    AppState::new(RelayConfig {
        channel_capacity: 64,
        ..RelayConfig::default()
    })
}

/// Same as [`test_app_state`] with one streaming session `s1` owned by `alice`.
pub fn test_app_state_with_session() -> AppState {
    let state = test_app_state();
    state.relay.start_session(
        "s1",
        SessionMetadata {
            username: "alice".into(),
            project_path: "/work/demo".into(),
            project_name: "demo".into(),
            display_name: "Demo".into(),
            status: None,
        },
    );
    state
}

/// Read a response body as JSON.
pub async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json body")
}

/// Collect the `data:` payloads of an SSE body until it has been idle for
/// `idle`.
pub async fn sse_payloads(resp: axum::response::Response, idle: Duration) -> Vec<serde_json::Value> {
    use futures::StreamExt;

    let mut stream = resp.into_body().into_data_stream();
    let mut raw = String::new();
    while let Ok(Some(Ok(chunk))) = tokio::time::timeout(idle, stream.next()).await {
        raw.push_str(&String::from_utf8_lossy(&chunk));
    }

    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
