use thiserror::Error;

/// Errors raised by a client channel write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The client went away
    #[error("channel closed")]
    Closed,
    /// The client's outbound queue is full
    #[error("channel full")]
    Full,
}

/// Errors surfaced by relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Session is not registered
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// Task is unknown for this session
    #[error("task not found: {session_id}/{task_id}")]
    TaskNotFound { session_id: String, task_id: String },
    /// Message could not be serialized
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Channel write failed
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
