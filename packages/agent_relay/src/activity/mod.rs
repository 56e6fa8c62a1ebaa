//! Agent Activity Summaries
//!
//! Turns the engine's raw phase changes into a smoothed, human-facing
//! activity indicator for one session.
//!
//! # Architecture
//!
//! The engine drives an [`ActivityTracker`] per session:
//! - `start_thinking` - model is reasoning (debounced, so short bursts never show)
//! - `start_tool` / `update_tool_progress` / `complete_tool` - a tool call
//! - `finish` - turn over, back to idle
//!
//! And the tracker maintains a state machine:
//! - `Idle` - initial state, re-entered after every turn
//! - `Thinking` - between tool calls or before the first one
//! - `ToolExecuting` - a tool is running
//!
//! Non-idle updates are throttled to one per window; longer-running states
//! carry progressively more detail (`description`, then `elapsed`).

mod state;
mod timer;
mod tracker;

pub use state::{ActivityConfig, ActivityEvent, ActivityState};
pub use timer::ScheduledCallback;
pub use tracker::{ActivityTracker, PublishFn};
