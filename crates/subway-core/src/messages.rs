//! Protocol message vocabulary.
//!
//! Every frame on the wire is a JSON object `{ "type", "id"?, "payload"? }`.
//! Type strings that are not part of the vocabulary are preserved in
//! [`MessageType::Unknown`] so they can be reported back to the client.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::ExecutionError;
use crate::execution::ExecutionResult;

/// Message type discriminator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Client asks to initialize the connection.
    ConnectionInit,
    /// Server accepted the connection.
    ConnectionAck,
    /// Server rejected a connection-level message.
    ConnectionError,
    /// Server keep-alive.
    KeepAlive,
    /// Client asks to end the connection.
    ConnectionTerminate,
    /// Client starts an operation.
    Start,
    /// Server delivers a result for an operation.
    Data,
    /// Server reports an operation failure.
    Error,
    /// Server signals that an operation produced its last result.
    Complete,
    /// Client stops an operation.
    Stop,
    /// Anything else, with the type string as received.
    Unknown(String),
}

impl MessageType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::KeepAlive => "ka",
            Self::ConnectionTerminate => "connection_terminate",
            Self::Start => "start",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Stop => "stop",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connection_init" => Self::ConnectionInit,
            "connection_ack" => Self::ConnectionAck,
            "connection_error" => Self::ConnectionError,
            "ka" => Self::KeepAlive,
            "connection_terminate" => Self::ConnectionTerminate,
            "start" => Self::Start,
            "data" => Self::Data,
            "error" => Self::Error,
            "complete" => Self::Complete,
            "stop" => Self::Stop,
            _ => Self::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol message. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Client-assigned operation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationMessage {
    /// Build a message with no id or payload.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            id: None,
            payload: None,
        }
    }

    /// Attach an operation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// `connection_ack`.
    pub fn connection_ack() -> Self {
        Self::new(MessageType::ConnectionAck)
    }

    /// `ka`.
    pub fn keep_alive() -> Self {
        Self::new(MessageType::KeepAlive)
    }

    /// `connection_error` carrying a message and a numeric code.
    pub fn connection_error(message: &str, code: u16) -> Self {
        Self::new(MessageType::ConnectionError).with_payload(json!({
            "message": message,
            "code": code,
        }))
    }

    /// `data` for an operation.
    pub fn data(id: &str, result: &ExecutionResult) -> Self {
        Self::new(MessageType::Data)
            .with_id(id)
            .with_payload(result.to_payload())
    }

    /// `error` for an operation, carrying one or more errors.
    pub fn error(id: &str, errors: &[ExecutionError]) -> Self {
        let errors: Vec<Value> = errors.iter().map(ExecutionError::to_payload).collect();
        Self::new(MessageType::Error)
            .with_id(id)
            .with_payload(json!({ "errors": errors }))
    }

    /// `complete` for an operation.
    pub fn complete(id: &str) -> Self {
        Self::new(MessageType::Complete).with_id(id)
    }

    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The id, if present and non-empty.
    pub fn operation_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}
