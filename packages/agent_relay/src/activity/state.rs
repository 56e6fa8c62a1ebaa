//! Activity State Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse activity of an agent session
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Waiting for the user
    #[default]
    Idle,

    /// Model is reasoning, no tool running
    Thinking,

    /// A tool call is in flight
    ToolExecuting,
}

impl ActivityState {
    /// Returns true if the agent is doing something
    pub fn is_active(&self) -> bool {
        !matches!(self, ActivityState::Idle)
    }
}

/// Activity update delivered to clients (`type: "agent-activity"`)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub session_id: String,
    pub state: ActivityState,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whole seconds spent in the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<u64>,
}

/// Timing knobs for an activity tracker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityConfig {
    /// How long thinking must last before it is shown
    pub thinking_delay: Duration,
    /// Minimum gap between two non-idle emissions
    pub throttle_window: Duration,
    /// Time in a tool before progress updates are forwarded
    pub progress_min_elapsed: Duration,
    /// Time in a state before a description is attached
    pub description_after: Duration,
    /// Time in a state before elapsed seconds are attached
    pub elapsed_after: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            thinking_delay: Duration::from_millis(1000),
            throttle_window: Duration::from_millis(500),
            progress_min_elapsed: Duration::from_millis(5000),
            description_after: Duration::from_millis(3000),
            elapsed_after: Duration::from_millis(5000),
        }
    }
}

/// Indicator text for a state.
pub(crate) fn label_for(state: ActivityState, tool_name: Option<&str>) -> String {
    match (state, tool_name) {
        (ActivityState::Idle, _) => "Idle".to_string(),
        (ActivityState::Thinking, _) => "Thinking...".to_string(),
        (ActivityState::ToolExecuting, Some(tool)) if !tool.is_empty() => {
            format!("Running {tool}")
        }
        (ActivityState::ToolExecuting, _) => "Working...".to_string(),
    }
}

/// Fallback description when neither an override nor a tool summary exists.
pub(crate) fn default_description(state: ActivityState, tool_name: Option<&str>) -> String {
    match (state, tool_name) {
        (ActivityState::ToolExecuting, Some(tool)) if !tool.is_empty() => {
            format!("{tool} is still running")
        }
        (ActivityState::ToolExecuting, _) => "Still working".to_string(),
        (ActivityState::Thinking, _) => "Still thinking".to_string(),
        (ActivityState::Idle, _) => "Waiting for input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(label_for(ActivityState::Idle, None), "Idle");
        assert_eq!(label_for(ActivityState::Thinking, Some("Bash")), "Thinking...");
        assert_eq!(
            label_for(ActivityState::ToolExecuting, Some("Bash")),
            "Running Bash"
        );
        assert_eq!(label_for(ActivityState::ToolExecuting, None), "Working...");
        assert_eq!(label_for(ActivityState::ToolExecuting, Some("")), "Working...");
    }

    #[test]
    fn event_serializes_flat_and_sparse() {
        let event = ActivityEvent {
            session_id: "s1".into(),
            state: ActivityState::ToolExecuting,
            label: "Running Bash".into(),
            tool_name: Some("Bash".into()),
            tool_summary: Some("$ ls".into()),
            description: None,
            elapsed: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "tool_executing");
        assert_eq!(json["toolName"], "Bash");
        assert_eq!(json["toolSummary"], "$ ls");
        assert!(json.get("description").is_none());
        assert!(json.get("elapsed").is_none());
    }

    #[test]
    fn is_active() {
        assert!(!ActivityState::Idle.is_active());
        assert!(ActivityState::Thinking.is_active());
        assert!(ActivityState::ToolExecuting.is_active());
    }
}
