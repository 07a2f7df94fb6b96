//! Shared doubles for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use subway_core::OperationMessage;

use crate::errors::TransportError;
use crate::transport::Transport;

#[derive(Default)]
struct Recorded {
    sent: Vec<String>,
    close: Option<(u16, String)>,
    closed: bool,
}

/// Transport that records every frame in memory.
#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Raw text frames written so far.
    pub(crate) fn sent(&self) -> Vec<String> {
        self.inner.lock().sent.clone()
    }

    /// Decoded messages written so far.
    pub(crate) fn messages(&self) -> Vec<OperationMessage> {
        self.sent()
            .iter()
            .map(|text| OperationMessage::from_json(text).unwrap())
            .collect()
    }

    /// Wire type names written so far.
    pub(crate) fn types(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .map(|m| m.message_type.as_str().to_owned())
            .collect()
    }

    /// Messages of one wire type.
    pub(crate) fn of_type(&self, wire: &str) -> Vec<OperationMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.message_type.as_str() == wire)
            .collect()
    }

    /// Close frame, if one was sent.
    pub(crate) fn close_frame(&self) -> Option<(u16, String)> {
        self.inner.lock().close.clone()
    }

    /// Simulate the peer going away.
    pub(crate) fn mark_closed(&self) {
        self.inner.lock().closed = true;
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.sent.push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            inner.close = Some((code, reason.to_owned()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
