//! Bounded per-session replay buffers.
//!
//! Each streaming session keeps the serialized events it has produced so a
//! client that (re)connects mid-session can catch up. Buffering is opt-in:
//! nothing is stored until [`ReplayBuffers::start_session_buffer`] is called.
//!
//! A buffer never exceeds its entry or byte cap. When an append would cross
//! either cap the buffer is marked overflowed and refuses every further
//! append; existing entries are never evicted or truncated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::ClientChannel;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::protocol::ServerEvent;

/// Default maximum number of entries per session buffer.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Default maximum cumulative size per session buffer.
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Capacity limits applied to every session buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Result of offering a message to a session buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Appended
    Buffered,
    /// No buffer is active for the session
    Inactive,
    /// Buffer is full; message dropped
    Dropped,
}

#[derive(Default)]
struct SessionBuffer {
    entries: Vec<Arc<str>>,
    bytes: usize,
    overflowed: bool,
}

/// Replay buffers for all sessions.
pub struct ReplayBuffers {
    buffers: Mutex<HashMap<String, SessionBuffer>>,
    limits: BufferLimits,
    metrics: Arc<RelayMetrics>,
}

impl Default for ReplayBuffers {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}

impl ReplayBuffers {
    pub fn new(limits: BufferLimits) -> Self {
        Self::with_metrics(limits, Arc::new(RelayMetrics::new()))
    }

    pub fn with_metrics(limits: BufferLimits, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            limits,
            metrics,
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// (Re)initialize an empty buffer for `session_id`.
    pub fn start_session_buffer(&self, session_id: &str) {
        self.lock()
            .insert(session_id.to_string(), SessionBuffer::default());
        debug!(session_id = %session_id, "Replay buffer started");
    }

    /// Serialize `message` and append it to the session's buffer.
    pub fn broadcast_to_session<T: Serialize>(
        &self,
        session_id: &str,
        message: &T,
    ) -> Result<BufferOutcome, RelayError> {
        let text = serde_json::to_string(message)?;
        Ok(self.broadcast_serialized(session_id, text))
    }

    /// Append an already-serialized message. The text is stored verbatim.
    pub fn broadcast_serialized(&self, session_id: &str, text: String) -> BufferOutcome {
        let mut buffers = self.lock();
        let Some(buffer) = buffers.get_mut(session_id) else {
            return BufferOutcome::Inactive;
        };

        if buffer.overflowed {
            self.metrics.buffered_message_dropped();
            return BufferOutcome::Dropped;
        }

        let size = text.len();
        let fits = buffer.entries.len() < self.limits.max_entries
            && buffer.bytes + size <= self.limits.max_bytes;

        if !fits {
            buffer.overflowed = true;
            self.metrics.buffer_overflowed();
            self.metrics.buffered_message_dropped();
            warn!(
                session_id = %session_id,
                entries = buffer.entries.len(),
                bytes = buffer.bytes,
                "Replay buffer full, dropping further events for this session"
            );
            return BufferOutcome::Dropped;
        }

        buffer.entries.push(Arc::from(text));
        buffer.bytes += size;
        self.metrics.message_buffered();
        BufferOutcome::Buffered
    }

    /// Replay the session's buffer to `channel`, framed by `replay-start`
    /// and `replay-end`. Does nothing for an empty or unknown buffer.
    ///
    /// Liveness is re-checked before every write; a channel that closes
    /// mid-replay just stops receiving. Returns the number of buffered
    /// messages written.
    pub async fn replay_to_client(&self, session_id: &str, channel: &dyn ClientChannel) -> usize {
        let entries: Vec<Arc<str>> = {
            let buffers = self.lock();
            match buffers.get(session_id) {
                Some(buffer) if !buffer.entries.is_empty() => buffer.entries.clone(),
                _ => return 0,
            }
        };

        let start = marker(&ServerEvent::ReplayStart {
            session_id: session_id.to_string(),
        });
        if !write_if_open(channel, start).await {
            return 0;
        }

        let mut sent = 0;
        for entry in &entries {
            if !write_if_open(channel, entry.to_string()).await {
                debug!(session_id = %session_id, sent, "Client closed during replay");
                self.metrics.replay_sent(sent as u64);
                return sent;
            }
            sent += 1;
        }

        let end = marker(&ServerEvent::ReplayEnd {
            session_id: session_id.to_string(),
        });
        write_if_open(channel, end).await;

        self.metrics.replay_sent(sent as u64);
        debug!(session_id = %session_id, sent, "Replayed session buffer");
        sent
    }

    /// Drop the session's buffer and byte counter.
    pub fn clear_session_buffer(&self, session_id: &str) {
        if self.lock().remove(session_id).is_some() {
            debug!(session_id = %session_id, "Replay buffer cleared");
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Number of buffered entries (0 for unknown sessions).
    pub fn buffer_len(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map(|b| b.entries.len())
            .unwrap_or(0)
    }

    /// Cumulative buffered bytes (0 for unknown sessions).
    pub fn buffer_bytes(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map(|b| b.bytes).unwrap_or(0)
    }

    pub fn is_overflowed(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .map(|b| b.overflowed)
            .unwrap_or(false)
    }

    /// Copy of the buffered messages in insertion order.
    pub fn entries(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .get(session_id)
            .map(|b| b.entries.iter().map(|e| e.to_string()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionBuffer>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn marker(event: &ServerEvent) -> String {
    // Markers only hold a session id string; serialization cannot fail.
    serde_json::to_string(event).unwrap_or_default()
}

async fn write_if_open(channel: &dyn ClientChannel, text: String) -> bool {
    if !channel.is_open() {
        return false;
    }
    channel.send_text(text).await.is_ok()
}
