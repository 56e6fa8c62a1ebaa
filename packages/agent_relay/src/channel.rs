//! Client Channels
//!
//! The seam between the relay and a transport. A channel exposes a liveness
//! check and a framed text write; the transport owns the actual socket.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::response::sse::Event;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// A connected client that can receive serialized events.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Whether the client is still connected. Checked before every write.
    fn is_open(&self) -> bool;

    /// Write one serialized message, waiting for queue space.
    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    /// Write without waiting. Live fan-out drops instead of blocking.
    fn try_send_text(&self, text: String) -> Result<(), ChannelError>;
}

/// Channel backed by the outbound queue of a WebSocket writer task.
#[derive(Clone, Debug)]
pub struct QueueChannel {
    tx: mpsc::Sender<String>,
}

impl QueueChannel {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Create a channel plus the receiving end for the writer task.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Resolves once the writer task has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[async_trait]
impl ClientChannel for QueueChannel {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx.send(text).await.map_err(|_| ChannelError::Closed)
    }

    fn try_send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

/// Channel that frames each message as a server-sent event.
#[derive(Clone, Debug)]
pub struct SseChannel {
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

impl SseChannel {
    pub fn new(tx: mpsc::Sender<Result<Event, Infallible>>) -> Self {
        Self { tx }
    }

    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Result<Event, Infallible>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Resolves once the response stream has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[async_trait]
impl ClientChannel for SseChannel {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx
            .send(Ok(Event::default().data(text)))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn try_send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx
            .try_send(Ok(Event::default().data(text)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Full,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }
}
