//! End-to-end flows through the public relay API.

use std::sync::Arc;
use std::time::Duration;

use agent_relay::channel::QueueChannel;
use agent_relay::config::RelayConfig;
use agent_relay::protocol::{ServerEvent, TaskUpdateKind};
use agent_relay::registry::SessionMetadata;
use agent_relay::replay::BufferLimits;
use agent_relay::tasks::{PathOutcome, TaskResult, TaskStart};
use agent_relay::{Relay, RelayMetrics};
use serde_json::Value;
use tokio::sync::mpsc::Receiver;

fn alice() -> SessionMetadata {
    SessionMetadata {
        username: "alice".into(),
        project_path: "/p".into(),
        project_name: "p".into(),
        display_name: "P".into(),
        status: None,
    }
}

fn drain(rx: &mut Receiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

fn types(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

/// Strip the bus timestamp so live and replayed copies compare equal.
fn without_timestamp(mut event: Value) -> Value {
    if let Some(obj) = event.as_object_mut() {
        obj.remove("timestamp");
    }
    event
}

#[tokio::test]
async fn publish_without_subscribers_is_silent() {
    let relay = Relay::default();
    let delivered = relay.bus().publish(
        "nobody",
        ServerEvent::ReplayEnd {
            session_id: "s".into(),
        },
    );

    assert_eq!(delivered, 0);
    assert_eq!(relay.bus().user_count(), 0);
    assert!(relay.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn agent_turn_reaches_live_and_late_clients() {
    let relay = Relay::default();
    relay.start_session("s1", alice());

    let (live, mut live_rx) = QueueChannel::pair(64);
    let _live_sub = relay.connect("alice", None, Arc::new(live)).await.unwrap();

    let activity = relay.activity("s1").unwrap();
    activity.start_thinking();
    // thinking shows at 1000ms; the tool starts after the throttle window
    tokio::time::sleep(Duration::from_millis(1600)).await;

    activity.start_tool("Bash", Some("$ ls".into()));
    let (task, _) = relay
        .start_task(
            "s1",
            TaskStart {
                title: Some("Bash".into()),
                ..Default::default()
            },
        )
        .await;
    relay
        .complete_task(
            "s1",
            &task.task_id,
            TaskResult {
                output: Some(serde_json::json!("ok")),
                metadata: None,
            },
        )
        .await
        .unwrap();
    activity.complete_tool();
    activity.finish();

    let live_events = drain(&mut live_rx);
    assert_eq!(
        types(&live_events),
        vec![
            "snapshot",
            "agent-activity",
            "agent-activity",
            "task-started",
            "task-completed",
            "agent-activity"
        ]
    );
    assert_eq!(live_events[1]["label"], "Thinking...");
    assert_eq!(live_events[2]["label"], "Running Bash");
    assert_eq!(live_events[4]["data"]["output"], "ok");
    assert_eq!(live_events[5]["state"], "idle");

    // A second tab joining late catches up from the replay buffer
    let (late, mut late_rx) = QueueChannel::pair(64);
    let _late_sub = relay
        .connect("alice", Some("s1"), Arc::new(late))
        .await
        .unwrap();
    let late_events = drain(&mut late_rx);

    assert_eq!(late_events[0]["type"], "snapshot");
    assert_eq!(late_events[1]["type"], "replay-start");
    assert_eq!(late_events.last().unwrap()["type"], "replay-end");

    let replayed: Vec<Value> = late_events[2..late_events.len() - 1].to_vec();
    let live_payloads: Vec<Value> = live_events[1..]
        .iter()
        .cloned()
        .map(without_timestamp)
        .collect();
    assert_eq!(replayed, live_payloads);
}

#[tokio::test]
async fn overflowed_session_keeps_its_prefix() {
    let metrics = Arc::new(RelayMetrics::new());
    let relay = Relay::with_metrics(
        RelayConfig {
            buffer: BufferLimits {
                max_entries: 3,
                max_bytes: 1024 * 1024,
            },
            ..RelayConfig::default()
        },
        metrics.clone(),
    );
    relay.start_session("s1", alice());

    let mut ids = Vec::new();
    for _ in 0..6 {
        let (task, _) = relay.start_task("s1", TaskStart::default()).await;
        ids.push(task.task_id);
    }

    assert!(relay.buffers().is_overflowed("s1"));
    assert_eq!(relay.buffers().buffer_len("s1"), 3);

    let (client, mut rx) = QueueChannel::pair(64);
    let _sub = relay
        .connect("alice", Some("s1"), Arc::new(client))
        .await
        .unwrap();
    let events = drain(&mut rx);
    let replayed: Vec<&str> = events[2..5]
        .iter()
        .map(|e| e["data"]["taskId"].as_str().unwrap())
        .collect();
    assert_eq!(replayed, ids[..3].iter().map(String::as_str).collect::<Vec<_>>());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.buffers.overflows, 1);
    assert_eq!(snapshot.buffers.dropped, 3);
    assert_eq!(snapshot.tasks.started, 6);
}

#[tokio::test]
async fn task_envelope_is_identical_on_every_path() {
    let relay = Relay::default();
    relay.start_session("s1", alice());

    let (live, mut live_rx) = QueueChannel::pair(16);
    let _sub = relay.connect("alice", None, Arc::new(live)).await.unwrap();
    drain(&mut live_rx);

    let (legacy, mut legacy_rx) = QueueChannel::pair(16);
    let task = relay.tasks().track_task_start("s1", TaskStart::default());
    let report = relay
        .tasks()
        .broadcast_task_update(
            Some(&legacy),
            TaskUpdateKind::Started,
            &task,
            Some("alice"),
            Some("s1"),
        )
        .await;
    assert_eq!(report.bus, PathOutcome::Delivered);
    assert_eq!(report.buffer, PathOutcome::Delivered);
    assert_eq!(report.channel, PathOutcome::Delivered);

    let from_bus = without_timestamp(drain(&mut live_rx).remove(0));
    let from_buffer: Value = serde_json::from_str(&relay.buffers().entries("s1")[0]).unwrap();
    let from_channel = drain(&mut legacy_rx).remove(0);

    assert_eq!(from_bus, from_buffer);
    assert_eq!(from_buffer, from_channel);
    assert_eq!(from_channel["sessionId"], "s1");
    assert_eq!(from_channel["data"]["taskId"], task.task_id.as_str());
}

#[tokio::test]
async fn unknown_task_outcomes_create_nothing() {
    let relay = Relay::default();
    relay.start_session("s1", alice());

    assert!(
        relay
            .tasks()
            .track_task_complete("s1", "missing", TaskResult::default())
            .is_none()
    );
    assert!(relay.tasks().track_task_failed("s2", "missing", "boom").is_none());
    assert!(relay.tasks().get_task("s1", "missing").is_none());
    assert!(relay.tasks().get_session_tasks("s1").is_empty());
    assert!(relay.tasks().get_session_tasks("s2").is_empty());
}

#[tokio::test]
async fn reregistering_keeps_created_at() {
    let relay = Relay::default();
    let first = relay.start_session("s1", alice());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = relay.registry().register(
        "s1",
        SessionMetadata {
            status: Some(agent_relay::registry::SessionStatus::Idle),
            ..alice()
        },
    );
    assert_eq!(second.created_at, first.created_at);
    assert!(second.last_active_at > first.last_active_at);

    let summary = &relay.registry().get_sessions_for_user("alice")[0];
    assert_eq!(summary.record.status, agent_relay::registry::SessionStatus::Idle);
}
