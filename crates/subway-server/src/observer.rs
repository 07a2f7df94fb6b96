//! Turns one operation's event stream into protocol messages.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use subway_core::{EventStream, ExecutionError, OperationMessage, PanicError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::metrics::{OPERATION_ERRORS_TOTAL, OPERATIONS_ACTIVE};
use crate::registry::SubscriptionRegistry;
use crate::writer::OrderedWriter;

/// When an operation ends because of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorPolicy {
    /// End the operation after an error event.
    pub disconnect_after_error_event: bool,
    /// End the operation after any result that carries errors.
    pub disconnect_after_any_error: bool,
}

/// Forwards a live operation's events until the stream ends or the
/// operation is disposed.
pub(crate) struct StreamObserver {
    pub(crate) id: String,
    pub(crate) token: u64,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) writer: OrderedWriter,
    pub(crate) policy: ErrorPolicy,
    pub(crate) cancel: CancellationToken,
}

impl StreamObserver {
    /// Spawn the observer task. Caller must already hold the live slot.
    pub(crate) fn spawn(self, stream: EventStream) {
        gauge!(OPERATIONS_ACTIVE).increment(1.0);
        let _ = tokio::spawn(async move {
            self.run(stream).await;
            gauge!(OPERATIONS_ACTIVE).decrement(1.0);
        });
    }

    #[instrument(skip_all, fields(operation_id = %self.id))]
    async fn run(self, mut stream: EventStream) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("operation disposed");
                    return;
                }
                item = AssertUnwindSafe(stream.next()).catch_unwind() => item,
            };

            let next = match next {
                Ok(next) => next,
                Err(panic) => {
                    let panic = PanicError::from_payload(panic.as_ref());
                    error!(error = %panic, "event stream panicked");
                    let wrapped = ExecutionError::unhandled(&panic);
                    counter!(OPERATION_ERRORS_TOTAL, "kind" => wrapped.kind.default_code())
                        .increment(1);
                    self.send(OperationMessage::error(&self.id, &[wrapped])).await;
                    self.finish();
                    return;
                }
            };

            match next {
                Some(Ok(result)) => {
                    let failed = result.has_errors();
                    self.send(OperationMessage::data(&self.id, &result)).await;
                    if failed && self.policy.disconnect_after_any_error {
                        debug!("result carried errors, ending operation");
                        self.finish();
                        return;
                    }
                }
                Some(Err(error)) => {
                    counter!(OPERATION_ERRORS_TOTAL, "kind" => error.kind.default_code())
                        .increment(1);
                    self.send(OperationMessage::error(&self.id, &[error])).await;
                    if self.policy.disconnect_after_error_event
                        || self.policy.disconnect_after_any_error
                    {
                        debug!("error event, ending operation");
                        self.finish();
                        return;
                    }
                }
                None => {
                    self.send(OperationMessage::complete(&self.id)).await;
                    self.finish();
                    return;
                }
            }
        }
    }

    async fn send(&self, message: OperationMessage) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.writer.send(message).await {
            debug!(error = %e, "writer closed, dropping operation output");
        }
    }

    fn finish(&self) {
        let _ = self.registry.remove_if_current(&self.id, self.token);
    }
}
