//! Per-session Activity Tracker
//!
//! ## Emission rules
//!
//! - Thinking is debounced: it is only shown if it lasts `thinking_delay`.
//!   A tool call starting inside that window cancels the pending emission.
//! - Non-idle emissions are throttled to one per `throttle_window`; extra
//!   updates inside the window are dropped, not queued.
//! - Idle is never throttled.
//! - Detail grows with time in state: nothing below `description_after`,
//!   a description below `elapsed_after`, a description plus whole elapsed
//!   seconds beyond it.
//!
//! The throttle check and the last-emission update happen under one lock,
//! so concurrent callers cannot both pass the gate.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::time::Instant;
use tracing::debug;

use crate::metrics::RelayMetrics;

use super::state::{
    ActivityConfig, ActivityEvent, ActivityState, default_description, label_for,
};
use super::timer::ScheduledCallback;

/// Sink for activity events (typically backed by the event bus).
pub type PublishFn = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

struct TrackerState {
    state: ActivityState,
    state_entered: Instant,
    tool_name: Option<String>,
    tool_summary: Option<String>,
    last_emit: Option<Instant>,
    thinking_timer: ScheduledCallback,
    /// Bumped whenever the thinking timer is cancelled, so a timer that
    /// already woke up can tell it is stale.
    timer_generation: u64,
}

struct TrackerInner {
    session_id: String,
    publish: PublishFn,
    config: ActivityConfig,
    metrics: Option<Arc<RelayMetrics>>,
    state: Mutex<TrackerState>,
}

/// Activity state machine for one session.
///
/// The thinking debounce spawns a timer task on the current tokio runtime.
/// Outside a runtime the tracker still works but never reports thinking.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<TrackerInner>,
}

impl ActivityTracker {
    pub fn new(session_id: impl Into<String>, publish: PublishFn, config: ActivityConfig) -> Self {
        Self::build(session_id.into(), publish, config, None)
    }

    pub fn with_metrics(
        session_id: impl Into<String>,
        publish: PublishFn,
        config: ActivityConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self::build(session_id.into(), publish, config, Some(metrics))
    }

    fn build(
        session_id: String,
        publish: PublishFn,
        config: ActivityConfig,
        metrics: Option<Arc<RelayMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                session_id,
                publish,
                config,
                metrics,
                state: Mutex::new(TrackerState {
                    state: ActivityState::Idle,
                    state_entered: Instant::now(),
                    tool_name: None,
                    tool_summary: None,
                    last_emit: None,
                    thinking_timer: ScheduledCallback::none(),
                    timer_generation: 0,
                }),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Current state
    pub fn state(&self) -> ActivityState {
        self.inner.lock().state
    }

    /// Model started reasoning. Shown only if still thinking after the delay.
    pub fn start_thinking(&self) {
        let mut st = self.inner.lock();
        cancel_timer(&mut st);
        enter(&mut st, ActivityState::Thinking, None, None);

        let generation = st.timer_generation;
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        st.thinking_timer = ScheduledCallback::schedule(self.inner.config.thinking_delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.thinking_elapsed(generation);
            }
        });
        debug!(session_id = %self.inner.session_id, "Thinking started");
    }

    /// A tool call began.
    pub fn start_tool(&self, name: impl Into<String>, summary: Option<String>) {
        let event = {
            let mut st = self.inner.lock();
            cancel_timer(&mut st);
            enter(
                &mut st,
                ActivityState::ToolExecuting,
                Some(name.into()),
                summary,
            );
            self.inner.emit_locked(&mut st, None)
        };
        self.inner.deliver(event);
    }

    /// Forward progress of a long-running tool. Ignored unless a tool has
    /// been running for at least `progress_min_elapsed`.
    pub fn update_tool_progress(&self, detail: impl Into<String>) {
        let event = {
            let mut st = self.inner.lock();
            if st.state != ActivityState::ToolExecuting
                || st.state_entered.elapsed() < self.inner.config.progress_min_elapsed
            {
                return;
            }
            self.inner.emit_locked(&mut st, Some(detail.into()))
        };
        self.inner.deliver(event);
    }

    /// A tool call finished. Goes straight back to thinking without emitting,
    /// so back-to-back tools never flash idle.
    pub fn complete_tool(&self) {
        let mut st = self.inner.lock();
        enter(&mut st, ActivityState::Thinking, None, None);
    }

    /// Turn over. Always emits idle.
    pub fn finish(&self) {
        let event = {
            let mut st = self.inner.lock();
            cancel_timer(&mut st);
            enter(&mut st, ActivityState::Idle, None, None);
            self.inner.emit_locked(&mut st, None)
        };
        self.inner.deliver(event);
    }

    /// Emit the current state, subject to the throttle.
    pub fn emit(&self, detail: Option<String>) {
        let event = {
            let mut st = self.inner.lock();
            self.inner.emit_locked(&mut st, detail)
        };
        self.inner.deliver(event);
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn thinking_elapsed(&self, generation: u64) {
        let event = {
            let mut st = self.lock();
            if st.timer_generation != generation || st.state != ActivityState::Thinking {
                return;
            }
            self.emit_locked(&mut st, None)
        };
        self.deliver(event);
    }

    /// Build the event for the current state, or `None` if throttled.
    fn emit_locked(&self, st: &mut TrackerState, detail: Option<String>) -> Option<ActivityEvent> {
        let now = Instant::now();

        if st.state != ActivityState::Idle {
            if let Some(last) = st.last_emit {
                if now.duration_since(last) < self.config.throttle_window {
                    if let Some(metrics) = &self.metrics {
                        metrics.activity_throttled();
                    }
                    debug!(session_id = %self.session_id, state = ?st.state, "Activity update throttled");
                    return None;
                }
            }
        }

        let elapsed = now.duration_since(st.state_entered);
        let executing = st.state == ActivityState::ToolExecuting;

        let mut event = ActivityEvent {
            session_id: self.session_id.clone(),
            state: st.state,
            label: label_for(st.state, st.tool_name.as_deref()),
            tool_name: if executing { st.tool_name.clone() } else { None },
            tool_summary: if executing {
                st.tool_summary.clone()
            } else {
                None
            },
            description: None,
            elapsed: None,
        };

        if elapsed >= self.config.description_after {
            event.description = Some(
                detail
                    .or_else(|| st.tool_summary.clone())
                    .unwrap_or_else(|| default_description(st.state, st.tool_name.as_deref())),
            );
        }
        if elapsed >= self.config.elapsed_after {
            event.elapsed = Some((elapsed.as_millis() as f64 / 1000.0).round() as u64);
        }

        st.last_emit = Some(now);
        Some(event)
    }

    fn deliver(&self, event: Option<ActivityEvent>) {
        let Some(event) = event else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.activity_emitted();
        }
        debug!(session_id = %self.session_id, label = %event.label, "Activity emitted");
        (self.publish)(event);
    }
}

fn cancel_timer(st: &mut TrackerState) {
    st.thinking_timer.cancel();
    st.timer_generation += 1;
}

fn enter(
    st: &mut TrackerState,
    state: ActivityState,
    tool_name: Option<String>,
    tool_summary: Option<String>,
) {
    st.state = state;
    st.state_entered = Instant::now();
    st.tool_name = tool_name;
    st.tool_summary = tool_summary;
}
