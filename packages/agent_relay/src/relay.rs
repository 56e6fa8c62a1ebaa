//! Relay service state
//!
//! One `Relay` per process owns the bus, the replay buffers, the session
//! registry, the task tracker and one activity tracker per live session.
//! Handlers and the engine-facing API take it by `Arc`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityTracker, PublishFn};
use crate::bus::{EventBus, Subscription};
use crate::channel::ClientChannel;
use crate::config::RelayConfig;
use crate::error::{ChannelError, RelayError};
use crate::metrics::{HealthStatus, RelayMetrics, SessionHealth};
use crate::protocol::{BusEvent, ServerEvent, TaskUpdateKind};
use crate::registry::{SessionMetadata, SessionRecord, SessionRegistry, SessionStatus};
use crate::replay::ReplayBuffers;
use crate::tasks::{DeliveryReport, Task, TaskResult, TaskStart, TaskTracker};

pub struct Relay {
    bus: EventBus,
    buffers: Arc<ReplayBuffers>,
    registry: Arc<SessionRegistry>,
    tasks: TaskTracker,
    metrics: Arc<RelayMetrics>,
    config: RelayConfig,
    trackers: Mutex<HashMap<String, ActivityTracker>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_metrics(config, Arc::new(RelayMetrics::new()))
    }

    pub fn with_metrics(config: RelayConfig, metrics: Arc<RelayMetrics>) -> Self {
        let bus = EventBus::with_metrics(metrics.clone());
        let buffers = Arc::new(ReplayBuffers::with_metrics(config.buffer, metrics.clone()));
        let tasks = TaskTracker::new(bus.clone(), buffers.clone(), metrics.clone());
        Self {
            bus,
            buffers,
            registry: Arc::new(SessionRegistry::new()),
            tasks,
            metrics,
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn buffers(&self) -> &ReplayBuffers {
        &self.buffers
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Register (or re-register) a session and start buffering its events.
    pub fn start_session(&self, session_id: &str, metadata: SessionMetadata) -> SessionRecord {
        let record = self.registry.register(session_id, metadata);
        self.buffers.start_session_buffer(session_id);
        self.publish_status(session_id, &record);
        info!(session_id = %session_id, user = %record.username, "Session started");
        record
    }

    /// Change a session's coarse status and tell its owner.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Option<SessionRecord> {
        let record = self.registry.set_status(session_id, status)?;
        self.publish_status(session_id, &record);
        Some(record)
    }

    /// Session terminated (success, abort or error). The registry record is
    /// kept, marked idle, so reconnecting clients still see the session.
    pub fn end_session(&self, session_id: &str) -> Option<SessionRecord> {
        let tracker = self.lock_trackers().remove(session_id);
        if let Some(tracker) = tracker.filter(|t| t.state().is_active()) {
            tracker.finish();
        }
        self.buffers.clear_session_buffer(session_id);
        self.tasks.clear_session(session_id);

        let record = self.set_status(session_id, SessionStatus::Idle);
        info!(session_id = %session_id, known = record.is_some(), "Session ended");
        record
    }

    /// End a session and forget it entirely.
    pub fn remove_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.end_session(session_id);
        self.registry.remove(session_id)
    }

    fn owner_of(&self, session_id: &str) -> Option<String> {
        self.registry.get(session_id).map(|r| r.username)
    }

    fn publish_status(&self, session_id: &str, record: &SessionRecord) {
        self.bus.publish(
            &record.username,
            ServerEvent::SessionStatus {
                session_id: session_id.to_string(),
                status: record.status,
            },
        );
    }

    // =========================================================================
    // Activity
    // =========================================================================

    /// Activity tracker for a registered session, created on first use.
    ///
    /// Its events go into the session's replay buffer and to the live
    /// subscribers of whoever owns the session at emit time. Returns `None`
    /// for unknown sessions.
    pub fn activity(&self, session_id: &str) -> Option<ActivityTracker> {
        self.owner_of(session_id)?;

        let mut trackers = self.lock_trackers();
        if let Some(tracker) = trackers.get(session_id) {
            return Some(tracker.clone());
        }

        let bus = self.bus.clone();
        let buffers = self.buffers.clone();
        let registry = self.registry.clone();
        let sid = session_id.to_string();
        let publish: PublishFn = Arc::new(move |event: ActivityEvent| {
            let event = ServerEvent::AgentActivity(event);
            if let Err(e) = buffers.broadcast_to_session(&sid, &event) {
                warn!(session_id = %sid, "Failed to buffer activity event: {}", e);
            }
            match registry.get(&sid) {
                Some(record) => {
                    bus.publish(&record.username, event);
                }
                None => debug!(session_id = %sid, "Session no longer registered, activity not published"),
            }
        });

        let tracker = ActivityTracker::with_metrics(
            session_id,
            publish,
            self.config.activity.clone(),
            self.metrics.clone(),
        );
        trackers.insert(session_id.to_string(), tracker.clone());
        debug!(session_id = %session_id, "Activity tracker created");
        Some(tracker)
    }

    fn lock_trackers(&self) -> MutexGuard<'_, HashMap<String, ActivityTracker>> {
        self.trackers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Start tracking a tool execution and broadcast `task-started`.
    pub async fn start_task(&self, session_id: &str, start: TaskStart) -> (Task, DeliveryReport) {
        let task = self.tasks.track_task_start(session_id, start);
        let report = self
            .broadcast_task(session_id, TaskUpdateKind::Started, &task)
            .await;
        (task, report)
    }

    pub async fn task_progress(
        &self,
        session_id: &str,
        task_id: &str,
        progress: serde_json::Value,
    ) -> Result<Task, RelayError> {
        let task = self
            .tasks
            .track_task_progress(session_id, task_id, progress)
            .ok_or_else(|| task_not_found(session_id, task_id))?;
        self.broadcast_task(session_id, TaskUpdateKind::Updated, &task)
            .await;
        Ok(task)
    }

    pub async fn complete_task(
        &self,
        session_id: &str,
        task_id: &str,
        result: TaskResult,
    ) -> Result<Task, RelayError> {
        let task = self
            .tasks
            .track_task_complete(session_id, task_id, result)
            .ok_or_else(|| task_not_found(session_id, task_id))?;
        self.broadcast_task(session_id, TaskUpdateKind::Completed, &task)
            .await;
        Ok(task)
    }

    pub async fn fail_task(
        &self,
        session_id: &str,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<Task, RelayError> {
        let task = self
            .tasks
            .track_task_failed(session_id, task_id, error)
            .ok_or_else(|| task_not_found(session_id, task_id))?;
        self.broadcast_task(session_id, TaskUpdateKind::Failed, &task)
            .await;
        Ok(task)
    }

    async fn broadcast_task(
        &self,
        session_id: &str,
        kind: TaskUpdateKind,
        task: &Task,
    ) -> DeliveryReport {
        let owner = self.owner_of(session_id);
        self.registry.touch(session_id);
        self.tasks
            .broadcast_task_update(None, kind, task, owner.as_deref(), Some(session_id))
            .await
    }

    // =========================================================================
    // Client connections
    // =========================================================================

    /// Initial state for a (re)connecting client of `username`.
    pub fn snapshot_for(&self, username: &str) -> ServerEvent {
        ServerEvent::Snapshot {
            sessions: self.registry.get_sessions_for_user(username),
        }
    }

    /// Attach a client: snapshot, then a replay of `session_id` (if it is
    /// one of the user's sessions), then live events until the returned
    /// subscription is dropped.
    ///
    /// The subscription is registered before the snapshot is sent. Events
    /// published while the snapshot and replay are still being written are
    /// held and delivered right after `replay-end`, so nothing published
    /// during a connect is lost. An event racing the start of the replay may
    /// arrive twice.
    ///
    /// Live delivery never waits on the client. When its queue is full the
    /// event is dropped for that client only.
    pub async fn connect(
        &self,
        username: &str,
        session_id: Option<&str>,
        channel: Arc<dyn ClientChannel>,
    ) -> Result<Subscription, RelayError> {
        let gate = Arc::new(LiveGate::new(self.config.buffer.max_entries));
        let subscription = self.subscribe_client(username, channel.clone(), gate.clone());

        let snapshot = serde_json::to_string(&BusEvent::with_timestamp(
            self.snapshot_for(username),
            chrono::Utc::now().timestamp_millis(),
        ))?;
        channel.send_text(snapshot).await?;

        if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
            if self.owner_of(sid).as_deref() == Some(username) {
                self.buffers.replay_to_client(sid, channel.as_ref()).await;
            } else {
                debug!(user = %username, session_id = %sid, "Skipping replay of foreign or unknown session");
            }
        }

        let released = gate.release(channel.as_ref()).await;
        debug!(user = %username, session_id = ?session_id, released, "Client connected");
        Ok(subscription)
    }

    fn subscribe_client(
        &self,
        username: &str,
        channel: Arc<dyn ClientChannel>,
        gate: Arc<LiveGate>,
    ) -> Subscription {
        let user = username.to_string();
        self.bus.subscribe(
            username,
            Arc::new(move |event: &BusEvent| -> anyhow::Result<()> {
                let text = serde_json::to_string(event)?;
                let Some(text) = gate.hold(text) else {
                    return Ok(());
                };
                match channel.try_send_text(text) {
                    Ok(()) => Ok(()),
                    Err(ChannelError::Full) => {
                        debug!(user = %user, kind = event.event.kind(), "Client queue full, dropping event");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }),
        )
    }

    /// Liveness summary for `/health`.
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        HealthStatus {
            status: "ok".to_string(),
            sessions: SessionHealth {
                total: self.registry.len() as u64,
                streaming: self.registry.streaming_count() as u64,
            },
            connections: snapshot.connections.active,
            uptime_secs: snapshot.uptime_secs,
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

/// Live events held for a client that is still receiving its snapshot and
/// replay. The queue is `None` once the client is live.
struct LiveGate {
    held: Mutex<Option<VecDeque<String>>>,
    limit: usize,
}

impl LiveGate {
    fn new(limit: usize) -> Self {
        Self {
            held: Mutex::new(Some(VecDeque::new())),
            limit: limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<VecDeque<String>>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `text` while the gate is closed. Hands it back once open.
    fn hold(&self, text: String) -> Option<String> {
        let mut held = self.lock();
        let Some(queue) = held.as_mut() else {
            return Some(text);
        };
        if queue.len() < self.limit {
            queue.push_back(text);
        } else {
            debug!(limit = self.limit, "Held event queue full, dropping event");
        }
        None
    }

    /// Write every held event in order, then open the gate.
    ///
    /// Events arriving while a held one is being written join the queue, so
    /// ordering is kept until the queue is seen empty.
    async fn release(&self, channel: &dyn ClientChannel) -> usize {
        let mut sent = 0;
        loop {
            let next = {
                let mut held = self.lock();
                match held.as_mut().and_then(|queue| queue.pop_front()) {
                    Some(text) => text,
                    None => {
                        *held = None;
                        return sent;
                    }
                }
            };
            if channel.send_text(next).await.is_err() {
                *self.lock() = None;
                return sent;
            }
            sent += 1;
        }
    }
}

fn task_not_found(session_id: &str, task_id: &str) -> RelayError {
    RelayError::TaskNotFound {
        session_id: session_id.to_string(),
        task_id: task_id.to_string(),
    }
}
