//! Wire Protocol Types
//!
//! Envelopes delivered to clients over the event bus, the replay buffer and
//! direct channel writes. All three paths carry the same serialized shape.

use serde::{Deserialize, Serialize};

use crate::activity::ActivityEvent;
use crate::registry::{SessionStatus, SessionSummary};
use crate::tasks::Task;

/// Messages sent FROM the server TO clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    // === Task lifecycle ===
    /// A tool execution started
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: Task,
    },

    /// Progress or metadata changed on a running task
    #[serde(rename_all = "camelCase")]
    TaskUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: Task,
    },

    /// A tool execution finished successfully
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: Task,
    },

    /// A tool execution failed
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: Task,
    },

    // === Activity ===
    /// Smoothed human-facing activity indicator (flat, no `data` wrapper)
    AgentActivity(ActivityEvent),

    // === Replay framing ===
    #[serde(rename_all = "camelCase")]
    ReplayStart { session_id: String },

    #[serde(rename_all = "camelCase")]
    ReplayEnd { session_id: String },

    // === Session state ===
    /// Coarse session status change (idle / streaming)
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },

    /// Initial state for a newly (re)connected client
    Snapshot { sessions: Vec<SessionSummary> },
}

impl ServerEvent {
    /// The wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::TaskStarted { .. } => "task-started",
            ServerEvent::TaskUpdated { .. } => "task-updated",
            ServerEvent::TaskCompleted { .. } => "task-completed",
            ServerEvent::TaskFailed { .. } => "task-failed",
            ServerEvent::AgentActivity(_) => "agent-activity",
            ServerEvent::ReplayStart { .. } => "replay-start",
            ServerEvent::ReplayEnd { .. } => "replay-end",
            ServerEvent::SessionStatus { .. } => "session-status",
            ServerEvent::Snapshot { .. } => "snapshot",
        }
    }

    /// Session this event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::TaskStarted { session_id, .. }
            | ServerEvent::TaskUpdated { session_id, .. }
            | ServerEvent::TaskCompleted { session_id, .. }
            | ServerEvent::TaskFailed { session_id, .. } => session_id.as_deref(),
            ServerEvent::ReplayStart { session_id }
            | ServerEvent::ReplayEnd { session_id }
            | ServerEvent::SessionStatus { session_id, .. } => Some(session_id),
            ServerEvent::AgentActivity(activity) => Some(&activity.session_id),
            ServerEvent::Snapshot { .. } => None,
        }
    }
}

/// Which task lifecycle envelope to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskUpdateKind {
    Started,
    Updated,
    Completed,
    Failed,
}

impl TaskUpdateKind {
    /// Wrap a task snapshot in the envelope for this kind.
    pub fn envelope(self, session_id: Option<&str>, task: Task) -> ServerEvent {
        let session_id = session_id.map(str::to_string);
        match self {
            TaskUpdateKind::Started => ServerEvent::TaskStarted {
                session_id,
                data: task,
            },
            TaskUpdateKind::Updated => ServerEvent::TaskUpdated {
                session_id,
                data: task,
            },
            TaskUpdateKind::Completed => ServerEvent::TaskCompleted {
                session_id,
                data: task,
            },
            TaskUpdateKind::Failed => ServerEvent::TaskFailed {
                session_id,
                data: task,
            },
        }
    }
}

/// An event as delivered by the bus: the envelope plus a delivery timestamp
/// (epoch milliseconds). The bus stamps `timestamp` when it is absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl BusEvent {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            timestamp: None,
        }
    }

    pub fn with_timestamp(event: ServerEvent, timestamp: i64) -> Self {
        Self {
            event,
            timestamp: Some(timestamp),
        }
    }
}

impl From<ServerEvent> for BusEvent {
    fn from(event: ServerEvent) -> Self {
        BusEvent::new(event)
    }
}
