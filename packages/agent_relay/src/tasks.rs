//! Tool Execution Task Tracker
//!
//! Tracks the lifecycle of tool executions per session and fans each update
//! out over every delivery path a client might be listening on.
//!
//! A task moves `in_progress -> completed` or `in_progress -> failed`. Both
//! outcomes are terminal; a terminal task is never observed in progress again.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::channel::ClientChannel;
use crate::metrics::RelayMetrics;
use crate::protocol::TaskUpdateKind;
use crate::replay::{BufferOutcome, ReplayBuffers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Snapshot of one tracked tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    /// Set only on the terminal transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Caller-supplied fields for a new task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStart {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Fields merged into a task when it completes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of one delivery path in [`TaskTracker::broadcast_task_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    /// Path not attempted (no user, no session, or no open channel)
    Skipped,
    Delivered,
    /// Accepted by the path but not stored (buffer full)
    Dropped,
    Failed(String),
}

/// Per-path result of a task broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub bus: PathOutcome,
    pub buffer: PathOutcome,
    pub channel: PathOutcome,
}

struct TrackedTask {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct SessionTasks {
    next_seq: u64,
    tasks: HashMap<String, TrackedTask>,
}

pub struct TaskTracker {
    sessions: Mutex<HashMap<String, SessionTasks>>,
    bus: EventBus,
    buffers: Arc<ReplayBuffers>,
    metrics: Arc<RelayMetrics>,
}

impl TaskTracker {
    pub fn new(bus: EventBus, buffers: Arc<ReplayBuffers>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            bus,
            buffers,
            metrics,
        }
    }

    /// Record a new in-progress task for `session_id`.
    pub fn track_task_start(&self, session_id: &str, start: TaskStart) -> Task {
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::InProgress,
            start_time: Utc::now(),
            end_time: None,
            title: start.title,
            progress: start.progress,
            metadata: start.metadata,
            output: None,
            error: None,
        };

        let mut sessions = self.lock();
        let session = sessions.entry(session_id.to_string()).or_default();
        let seq = session.next_seq;
        session.next_seq += 1;
        session.tasks.insert(
            task.task_id.clone(),
            TrackedTask {
                seq,
                task: task.clone(),
            },
        );

        self.metrics.task_started();
        debug!(session_id = %session_id, task_id = %task.task_id, title = ?task.title, "Task started");
        task
    }

    /// Update progress on a running task. Terminal or unknown tasks are left alone.
    pub fn track_task_progress(
        &self,
        session_id: &str,
        task_id: &str,
        progress: serde_json::Value,
    ) -> Option<Task> {
        let mut sessions = self.lock();
        let tracked = sessions.get_mut(session_id)?.tasks.get_mut(task_id)?;
        if tracked.task.status.is_terminal() {
            debug!(session_id = %session_id, task_id = %task_id, "Ignoring progress for finished task");
            return None;
        }
        tracked.task.progress = Some(progress);
        Some(tracked.task.clone())
    }

    /// Mark a task completed and merge `result` into it.
    ///
    /// Returns `None` (and creates nothing) if the session or task is unknown.
    pub fn track_task_complete(
        &self,
        session_id: &str,
        task_id: &str,
        result: TaskResult,
    ) -> Option<Task> {
        let task = self.finish(session_id, task_id, TaskStatus::Completed, |task| {
            task.error = None;
            if result.output.is_some() {
                task.output = result.output;
            }
            if result.metadata.is_some() {
                task.metadata = result.metadata;
            }
        })?;
        self.metrics.task_completed();
        Some(task)
    }

    /// Mark a task failed with `error`.
    ///
    /// Returns `None` (and creates nothing) if the session or task is unknown.
    pub fn track_task_failed(
        &self,
        session_id: &str,
        task_id: &str,
        error: impl Into<String>,
    ) -> Option<Task> {
        let error = error.into();
        let task = self.finish(session_id, task_id, TaskStatus::Failed, |task| {
            task.output = None;
            task.error = Some(error);
        })?;
        self.metrics.task_failed();
        Some(task)
    }

    fn finish(
        &self,
        session_id: &str,
        task_id: &str,
        status: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Option<Task> {
        let mut sessions = self.lock();
        let tracked = sessions.get_mut(session_id)?.tasks.get_mut(task_id)?;
        let task = &mut tracked.task;

        if task.status.is_terminal() {
            // Last write wins; surfaced so duplicate engine callbacks are visible.
            warn!(
                session_id = %session_id,
                task_id = %task_id,
                from = ?task.status,
                to = ?status,
                "Task already finished, overwriting outcome"
            );
        }

        task.status = status;
        task.end_time = Some(Utc::now());
        apply(task);

        debug!(session_id = %session_id, task_id = %task_id, status = ?status, "Task finished");
        Some(task.clone())
    }

    pub fn get_task(&self, session_id: &str, task_id: &str) -> Option<Task> {
        self.lock()
            .get(session_id)?
            .tasks
            .get(task_id)
            .map(|t| t.task.clone())
    }

    /// All tasks of a session in start order; empty for unknown sessions.
    pub fn get_session_tasks(&self, session_id: &str) -> Vec<Task> {
        let sessions = self.lock();
        let Some(session) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut tracked: Vec<&TrackedTask> = session.tasks.values().collect();
        tracked.sort_by_key(|t| t.seq);
        tracked.into_iter().map(|t| t.task.clone()).collect()
    }

    /// Discard every task of a session.
    pub fn clear_session(&self, session_id: &str) {
        if let Some(session) = self.lock().remove(session_id) {
            debug!(session_id = %session_id, tasks = session.tasks.len(), "Cleared session tasks");
        }
    }

    /// Fan one task update out over the event bus, the session replay
    /// buffer and a legacy direct channel.
    ///
    /// The envelope is `{type, sessionId, data: <task>}` on every path. Each
    /// path is guarded on its own; a failure in one never stops the others.
    pub async fn broadcast_task_update(
        &self,
        channel: Option<&dyn ClientChannel>,
        kind: TaskUpdateKind,
        task: &Task,
        username: Option<&str>,
        session_id: Option<&str>,
    ) -> DeliveryReport {
        let username = username.filter(|u| !u.is_empty());
        let session_id = session_id.filter(|s| !s.is_empty());
        let event = kind.envelope(session_id, task.clone());
        let text = serde_json::to_string(&event);

        // 1. Live subscribers
        let bus = match username {
            None => PathOutcome::Skipped,
            Some(user) => guarded("bus", || {
                self.bus.publish(user, event.clone());
                PathOutcome::Delivered
            }),
        };

        // 2. Replay buffer for reconnecting clients
        let buffer = match (session_id, &text) {
            (None, _) => PathOutcome::Skipped,
            (Some(_), Err(e)) => {
                warn!("Failed to serialize task update for buffer: {}", e);
                PathOutcome::Failed(e.to_string())
            }
            (Some(sid), Ok(text)) => guarded("buffer", || {
                match self.buffers.broadcast_serialized(sid, text.clone()) {
                    BufferOutcome::Buffered => PathOutcome::Delivered,
                    BufferOutcome::Inactive => PathOutcome::Skipped,
                    BufferOutcome::Dropped => PathOutcome::Dropped,
                }
            }),
        };

        // 3. Legacy direct write
        let channel = match (channel, &text) {
            (Some(ch), Ok(text)) if ch.is_open() => match ch.send_text(text.clone()).await {
                Ok(()) => PathOutcome::Delivered,
                Err(e) => {
                    warn!(task_id = %task.task_id, "Direct task update write failed: {}", e);
                    PathOutcome::Failed(e.to_string())
                }
            },
            (Some(ch), Err(e)) if ch.is_open() => PathOutcome::Failed(e.to_string()),
            _ => PathOutcome::Skipped,
        };

        debug!(
            task_id = %task.task_id,
            kind = ?kind,
            bus = ?bus,
            buffer = ?buffer,
            channel = ?channel,
            "Broadcast task update"
        );
        DeliveryReport {
            bus,
            buffer,
            channel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionTasks>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn guarded(path: &str, deliver: impl FnOnce() -> PathOutcome) -> PathOutcome {
    match catch_unwind(AssertUnwindSafe(deliver)) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("Task update delivery path '{}' panicked", path);
            PathOutcome::Failed(format!("{path} panicked"))
        }
    }
}

#[cfg(test)]
pub(crate) fn test_task(task_id: &str) -> Task {
    Task {
        task_id: task_id.to_string(),
        status: TaskStatus::InProgress,
        start_time: Utc::now(),
        end_time: None,
        title: Some("Bash".to_string()),
        progress: None,
        metadata: None,
        output: None,
        error: None,
    }
}
