//! Customization points for protocol events.
//!
//! The controller calls one [`ConnectionHooks`] method per event and acts on
//! the returned [`HookOutcome`]: `Fatal` moves the connection to `Closed` and
//! tears it down. Every method has a default matching the `graphql-ws`
//! conventions, so [`DefaultHooks`] overrides nothing.

use async_trait::async_trait;
use subway_auth::AuthorizationOutcome;
use subway_core::close::{BLANK_ID, ID_EXISTS, UNRECOGNIZED};
use subway_core::{CloseReason, ErrorKind, ExecutionError, OperationMessage};
use tracing::debug;

use crate::writer::OrderedWriter;

/// Code reported when `start` reuses an active id.
pub const ID_ALREADY_EXISTS_CODE: &str = "ID_ALREADY_EXISTS";

/// Code reported when `start` arrives before initialization.
pub const NOT_INITIALIZED_CODE: &str = "NOT_INITIALIZED";

/// What the controller does after a hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Keep processing messages.
    Continue,
    /// Close the connection.
    Fatal,
}

impl HookOutcome {
    /// Whether the connection must be torn down.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

async fn emit(writer: &OrderedWriter, message: OperationMessage) {
    if let Err(e) = writer.send(message).await {
        debug!(error = %e, "hook output dropped");
    }
}

async fn close(writer: &OrderedWriter, reason: CloseReason) {
    if let Err(e) = writer.close(reason).await {
        debug!(error = %e, "close frame dropped");
    }
}

/// Per-event behavior of a connection.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// `connection_init` accepted.
    async fn on_acknowledge(&self, writer: &OrderedWriter) {
        emit(writer, OperationMessage::connection_ack()).await;
    }

    /// Keep-alive due. Return `false` once the writer is gone.
    async fn on_send_keep_alive(&self, writer: &OrderedWriter) -> bool {
        writer.send(OperationMessage::keep_alive()).await.is_ok()
    }

    /// Authentication or authorization failed during `connection_init`.
    async fn on_access_denied(
        &self,
        writer: &OrderedWriter,
        outcome: &AuthorizationOutcome,
    ) -> HookOutcome {
        debug!(?outcome, "access denied");
        let reason = CloseReason::access_denied();
        emit(
            writer,
            OperationMessage::connection_error(&reason.reason, reason.code),
        )
        .await;
        close(writer, reason).await;
        HookOutcome::Fatal
    }

    /// No `connection_init` arrived in time.
    async fn on_init_timeout(&self, writer: &OrderedWriter) -> HookOutcome {
        close(writer, CloseReason::init_timeout()).await;
        HookOutcome::Fatal
    }

    /// A second `connection_init` arrived.
    async fn on_too_many_init(&self, writer: &OrderedWriter) -> HookOutcome {
        close(writer, CloseReason::too_many_init()).await;
        HookOutcome::Fatal
    }

    /// `start` arrived before the connection was initialized.
    async fn on_not_initialized(&self, writer: &OrderedWriter, id: Option<&str>) -> HookOutcome {
        let message = "Connection has not been initialized";
        let out = match id {
            Some(id) => OperationMessage::error(
                id,
                &[ExecutionError::new(ErrorKind::Protocol, message).with_code(NOT_INITIALIZED_CODE)],
            ),
            None => OperationMessage::connection_error(message, UNRECOGNIZED),
        };
        emit(writer, out).await;
        HookOutcome::Continue
    }

    /// A frame that is not a known client message. `message` is `None` when
    /// the frame could not be decoded at all.
    async fn on_unrecognized(
        &self,
        writer: &OrderedWriter,
        message: Option<&OperationMessage>,
    ) -> HookOutcome {
        let text = match message {
            Some(m) => format!("Unrecognized message type: {}", m.message_type),
            None => "Invalid message".to_owned(),
        };
        emit(writer, OperationMessage::connection_error(&text, UNRECOGNIZED)).await;
        HookOutcome::Continue
    }

    /// `start` with an empty or missing id.
    async fn on_blank_id(&self, writer: &OrderedWriter) -> HookOutcome {
        emit(
            writer,
            OperationMessage::connection_error("Id cannot be blank", BLANK_ID),
        )
        .await;
        HookOutcome::Continue
    }

    /// `start` reused an active id.
    async fn on_id_exists(&self, writer: &OrderedWriter, id: &str) -> HookOutcome {
        debug!(id, code = ID_EXISTS, "duplicate operation id");
        let error = ExecutionError::new(
            ErrorKind::Protocol,
            format!("Subscriber for {id} already exists"),
        )
        .with_code(ID_ALREADY_EXISTS_CODE);
        emit(writer, OperationMessage::error(id, &[error])).await;
        HookOutcome::Continue
    }

    /// `connection_terminate`.
    async fn on_terminate(&self, writer: &OrderedWriter) -> HookOutcome {
        close(writer, CloseReason::normal()).await;
        HookOutcome::Fatal
    }
}

/// Hooks with every default behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ConnectionHooks for DefaultHooks {}
