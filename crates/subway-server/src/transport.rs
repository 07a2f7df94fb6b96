//! The byte-stream seam under the protocol engine.
//!
//! Only the [`OrderedWriter`](crate::writer::OrderedWriter) task touches a
//! [`Transport`]; everything else goes through the writer queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::TransportError;

/// Write half of a duplex connection.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Whether the transport can no longer be written to.
    fn is_closed(&self) -> bool;
}

/// Instant of the last message successfully written to a connection.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl ActivityClock {
    /// Clock starting now.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Last recorded activity.
    pub fn last(&self) -> Instant {
        *self.last.lock()
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last())
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Transport`] over the write half of an axum WebSocket.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl WsTransport {
    /// Wrap a socket sink.
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Err(e) = self.sink.send(Message::Text(text.into())).await {
            self.closed = true;
            return Err(TransportError::Io(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let _ = self.sink.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
