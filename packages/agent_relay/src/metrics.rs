//! Relay metrics for observability
//!
//! Counters for fan-out, buffering and activity throttling. Dropped events
//! never surface as errors, so these counters are the only place they show.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide relay metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently connected clients (SSE streams + WebSockets)
    pub active_connections: AtomicU64,
    /// Total connections since start
    pub total_connections: AtomicU64,
    /// Currently registered bus subscribers
    pub active_subscribers: AtomicU64,

    // Delivery metrics
    /// Publishes that reached at least one subscriber list
    pub events_published: AtomicU64,
    /// Individual subscriber deliveries that succeeded
    pub events_delivered: AtomicU64,
    /// Subscriber callbacks that returned an error or panicked
    pub subscriber_failures: AtomicU64,

    // Buffer metrics
    /// Messages appended to session replay buffers
    pub messages_buffered: AtomicU64,
    /// Buffers that transitioned into the overflowed state
    pub buffer_overflows: AtomicU64,
    /// Messages refused by a full buffer
    pub buffered_messages_dropped: AtomicU64,

    // Replay metrics
    pub replays: AtomicU64,
    pub replay_messages_sent: AtomicU64,

    // Activity metrics
    pub activity_emitted: AtomicU64,
    /// Non-idle activity updates dropped by the throttle window
    pub activity_throttled: AtomicU64,

    // Task metrics
    pub tasks_started: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,

    /// Start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscriber_added(&self) {
        self.active_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_removed(&self) {
        self.active_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    // Delivery tracking
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_delivered(&self, count: u64) {
        self.events_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn subscriber_failed(&self) {
        self.subscriber_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Buffer tracking
    pub fn message_buffered(&self) {
        self.messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_overflowed(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffered_message_dropped(&self) {
        self.buffered_messages_dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_sent(&self, messages: u64) {
        self.replays.fetch_add(1, Ordering::Relaxed);
        self.replay_messages_sent
            .fetch_add(messages, Ordering::Relaxed);
    }

    // Activity tracking
    pub fn activity_emitted(&self) {
        self.activity_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn activity_throttled(&self) {
        self.activity_throttled.fetch_add(1, Ordering::Relaxed);
    }

    // Task tracking
    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                subscribers: self.active_subscribers.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                published: self.events_published.load(Ordering::Relaxed),
                delivered: self.events_delivered.load(Ordering::Relaxed),
                subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            },
            buffers: BufferMetrics {
                buffered: self.messages_buffered.load(Ordering::Relaxed),
                overflows: self.buffer_overflows.load(Ordering::Relaxed),
                dropped: self.buffered_messages_dropped.load(Ordering::Relaxed),
                replays: self.replays.load(Ordering::Relaxed),
                replay_messages_sent: self.replay_messages_sent.load(Ordering::Relaxed),
            },
            activity: ActivityMetrics {
                emitted: self.activity_emitted.load(Ordering::Relaxed),
                throttled: self.activity_throttled.load(Ordering::Relaxed),
            },
            tasks: TaskMetrics {
                started: self.tasks_started.load(Ordering::Relaxed),
                completed: self.tasks_completed.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub delivery: DeliveryMetrics,
    pub buffers: BufferMetrics,
    pub activity: ActivityMetrics,
    pub tasks: TaskMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub subscribers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    pub published: u64,
    pub delivered: u64,
    pub subscriber_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferMetrics {
    pub buffered: u64,
    pub overflows: u64,
    pub dropped: u64,
    pub replays: u64,
    pub replay_messages_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMetrics {
    pub emitted: u64,
    pub throttled: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub streaming: u64,
}
