//! Client-facing streams
//!
//! A client connects once per browser tab, either as a server-sent event
//! stream or as a WebSocket. Both get the same sequence: a snapshot of the
//! user's sessions, an optional replay of one session, then live events.

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::AppState;
use crate::channel::{QueueChannel, SseChannel};
use crate::metrics::RelayMetrics;
use crate::relay::Relay;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Session to replay before live events start
    #[serde(default)]
    pub session: Option<String>,
}

/// Decrements the active connection count when the connection task ends.
struct ConnectionGuard(Arc<RelayMetrics>);

impl ConnectionGuard {
    fn open(metrics: Arc<RelayMetrics>) -> Self {
        metrics.connection_opened();
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// SSE stream of everything published to `user`.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let (channel, rx) = SseChannel::pair(state.relay.config().channel_capacity);
    let relay = state.relay.clone();
    let guard = ConnectionGuard::open(state.metrics.clone());

    // The response stream must be returned before the snapshot and replay
    // can drain, so connecting happens off the request task.
    tokio::spawn(async move {
        let _guard = guard;
        let subscription = match relay
            .connect(&user, query.session.as_deref(), Arc::new(channel.clone()))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(user = %user, "Failed to start event stream: {}", e);
                return;
            }
        };
        channel.closed().await;
        drop(subscription);
        debug!(user = %user, "Event stream closed");
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// SSE replay of one session's buffer; the stream ends after `replay-end`.
pub async fn replay_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (channel, rx) = SseChannel::pair(state.relay.config().channel_capacity);
    let relay = state.relay.clone();

    tokio::spawn(async move {
        let sent = relay.buffers().replay_to_client(&id, &channel).await;
        debug!(session_id = %id, sent, "Replay stream finished");
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

/// WebSocket carrying the same content as [`events_handler`].
pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.relay.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, relay, metrics, user, query.session))
}

async fn handle_socket(
    socket: WebSocket,
    relay: Arc<Relay>,
    metrics: Arc<RelayMetrics>,
    user: String,
    session: Option<String>,
) {
    let _guard = ConnectionGuard::open(metrics);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (channel, mut rx) = QueueChannel::pair(relay.config().channel_capacity);

    // Writer task: drain the outbound queue into the socket
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let subscription = match relay
        .connect(&user, session.as_deref(), Arc::new(channel))
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(user = %user, "Failed to attach WebSocket client: {}", e);
            writer.abort();
            return;
        }
    };

    // Clients only listen; read until the socket closes
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    drop(subscription);
    writer.abort();
    debug!(user = %user, "WebSocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::tasks::TaskStart;
    use crate::test_helpers::{sse_payloads, test_app_state_with_session};

    #[tokio::test]
    async fn test_replay_stream_is_framed() {
        let state = test_app_state_with_session();
        state.relay.start_task("s1", TaskStart::default()).await;
        state.relay.start_task("s1", TaskStart::default()).await;

        let app = Router::new()
            .route("/replay/{id}", get(replay_handler))
            .with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/replay/s1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let events = sse_payloads(resp, Duration::from_millis(200)).await;
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["replay-start", "task-started", "task-started", "replay-end"]
        );
    }

    #[tokio::test]
    async fn test_replay_of_empty_buffer_is_empty() {
        let state = test_app_state_with_session();
        let app = Router::new()
            .route("/replay/{id}", get(replay_handler))
            .with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/replay/s1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(sse_payloads(resp, Duration::from_millis(200)).await.is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_snapshot_replay_live() {
        let state = test_app_state_with_session();
        state.relay.start_task("s1", TaskStart::default()).await;

        let app = Router::new()
            .route("/users/{user}/events", get(events_handler))
            .with_state(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/users/alice/events?session=s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Wait for the subscription before publishing live events
        for _ in 0..50 {
            if state.relay.bus().subscriber_count("alice") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state.relay.end_session("s1");

        let events = sse_payloads(resp, Duration::from_millis(200)).await;
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec![
                "snapshot",
                "replay-start",
                "task-started",
                "replay-end",
                "session-status"
            ]
        );
        assert_eq!(events[0]["sessions"][0]["displayName"], "Demo");
        assert_eq!(state.metrics.snapshot().connections.total, 1);
    }
}
