//! Session Registry
//!
//! Coarse per-session metadata used to build the initial snapshot for a
//! (re)connecting client. Records live until explicitly removed.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Coarse status of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    #[default]
    Streaming,
}

/// Caller-supplied metadata for [`SessionRegistry::register`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub username: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub display_name: String,
    /// Defaults to `streaming` when omitted
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

/// Stored metadata for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub username: String,
    pub project_path: String,
    pub project_name: String,
    pub display_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// A record tagged with its session id (snapshot entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(flatten)]
    pub record: SessionRecord,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a session. `created_at` survives updates;
    /// `last_active_at` is always refreshed.
    pub fn register(&self, session_id: &str, metadata: SessionMetadata) -> SessionRecord {
        let now = Utc::now();
        let mut sessions = self.write();

        let created_at = sessions
            .get(session_id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let record = SessionRecord {
            username: metadata.username,
            project_path: metadata.project_path,
            project_name: metadata.project_name,
            display_name: metadata.display_name,
            status: metadata.status.unwrap_or_default(),
            created_at,
            last_active_at: now,
        };
        sessions.insert(session_id.to_string(), record.clone());

        debug!(session_id = %session_id, user = %record.username, status = ?record.status, "Session registered");
        record
    }

    /// Update status and activity time. Unknown sessions are ignored.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Option<SessionRecord> {
        let mut sessions = self.write();
        let record = sessions.get_mut(session_id)?;
        record.status = status;
        record.last_active_at = Utc::now();
        Some(record.clone())
    }

    /// Refresh `last_active_at` without changing status.
    pub fn touch(&self, session_id: &str) {
        if let Some(record) = self.write().get_mut(session_id) {
            record.last_active_at = Utc::now();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.read().get(session_id).cloned()
    }

    /// All sessions owned by `username`, oldest first.
    pub fn get_sessions_for_user(&self, username: &str) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .read()
            .iter()
            .filter(|(_, record)| record.username == username)
            .map(|(id, record)| SessionSummary {
                session_id: id.clone(),
                record: record.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.read()
            .get(session_id)
            .map(|r| r.status == SessionStatus::Streaming)
            .unwrap_or(false)
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        let removed = self.write().remove(session_id);
        if removed.is_some() {
            debug!(session_id = %session_id, "Session removed from registry");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of sessions currently streaming.
    pub fn streaming_count(&self) -> usize {
        self.read()
            .values()
            .filter(|r| r.status == SessionStatus::Streaming)
            .count()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}
