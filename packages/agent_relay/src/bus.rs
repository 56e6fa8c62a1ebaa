//! Per-user Event Bus
//!
//! Fans events out to every connected client (tab) of a user. Delivery is
//! synchronous and fire-and-forget: a user with no subscribers simply gets
//! nothing, and a failing subscriber never blocks the others.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::Utc;
use tracing::{debug, warn};

use crate::metrics::RelayMetrics;
use crate::protocol::BusEvent;

/// Callback invoked for every event published to the subscriber's user.
pub type SubscriberFn = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

type SubscriberMap = HashMap<String, Vec<(u64, SubscriberFn)>>;

struct BusInner {
    subscribers: RwLock<SubscriberMap>,
    next_id: AtomicU64,
    metrics: Arc<RelayMetrics>,
}

/// Per-user publish/subscribe fan-out.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(RelayMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Register a callback for `user`. The returned handle removes exactly
    /// this callback when unsubscribed or dropped.
    pub fn subscribe(&self, user: impl Into<String>, callback: SubscriberFn) -> Subscription {
        let user = user.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = write_lock(&self.inner.subscribers);
            subscribers
                .entry(user.clone())
                .or_default()
                .push((id, callback));
        }

        self.inner.metrics.subscriber_added();
        debug!(user = %user, subscriber = id, "Subscriber registered");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            user,
            id,
            active: true,
        }
    }

    /// Deliver `event` to every current subscriber of `user`.
    ///
    /// Stamps a timestamp if the event has none. Returns the number of
    /// callbacks that accepted the event.
    pub fn publish(&self, user: &str, event: impl Into<BusEvent>) -> usize {
        let mut event = event.into();
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now().timestamp_millis());
        }

        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let callbacks: Vec<(u64, SubscriberFn)> = {
            let subscribers = read_lock(&self.inner.subscribers);
            match subscribers.get(user) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        self.inner.metrics.event_published();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.inner.metrics.subscriber_failed();
                    warn!(user = %user, subscriber = id, "Subscriber rejected {}: {:#}", event.event.kind(), e);
                }
                Err(_) => {
                    self.inner.metrics.subscriber_failed();
                    warn!(user = %user, subscriber = id, "Subscriber panicked on {}", event.event.kind());
                }
            }
        }

        self.inner.metrics.events_delivered(delivered as u64);
        delivered
    }

    /// Number of live subscribers for `user`.
    pub fn subscriber_count(&self, user: &str) -> usize {
        read_lock(&self.inner.subscribers)
            .get(user)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Number of users with at least one subscriber.
    pub fn user_count(&self) -> usize {
        read_lock(&self.inner.subscribers).len()
    }
}

impl BusInner {
    fn remove(&self, user: &str, id: u64) -> bool {
        let mut subscribers = write_lock(&self.subscribers);
        let Some(list) = subscribers.get_mut(user) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(user);
        }
        removed
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<BusInner>,
    user: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Remove this subscriber. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if bus.remove(&self.user, self.id) {
            bus.metrics.subscriber_removed();
            debug!(user = %self.user, subscriber = self.id, "Subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("user", &self.user)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

// A panicking subscriber can't poison the map (callbacks run outside the
// lock), so recovering the guard is safe.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
