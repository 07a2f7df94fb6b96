//! Single-flight, FIFO outbound pipeline.
//!
//! Any number of producers hand messages to an [`OrderedWriter`]; one task
//! owns the [`Transport`] and writes them one at a time in queue order. A
//! closed transport swallows writes instead of failing the pipeline.

use metrics::counter;
use subway_core::{CloseReason, OperationMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::WriterError;
use crate::metrics::WRITER_DROPPED_MESSAGES_TOTAL;
use crate::transport::{ActivityClock, Transport};

/// An item waiting to be written.
#[derive(Debug)]
enum Outbound {
    Message(OperationMessage),
    Close(CloseReason),
}

#[derive(Clone)]
enum QueueTx {
    Bounded(mpsc::Sender<Outbound>),
    Unbounded(mpsc::UnboundedSender<Outbound>),
}

enum QueueRx {
    Bounded(mpsc::Receiver<Outbound>),
    Unbounded(mpsc::UnboundedReceiver<Outbound>),
}

impl QueueRx {
    async fn recv(&mut self) -> Option<Outbound> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            Self::Bounded(rx) => rx.close(),
            Self::Unbounded(rx) => rx.close(),
        }
    }
}

/// Handle to a connection's outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct OrderedWriter {
    tx: QueueTx,
    completed: CancellationToken,
    drained: CancellationToken,
}

impl OrderedWriter {
    /// Spawn the writer task over `transport`.
    ///
    /// `capacity` bounds the queue; `None` leaves it unbounded. `clock` is
    /// touched after every successful write.
    pub fn spawn<T: Transport>(transport: T, capacity: Option<usize>, clock: ActivityClock) -> Self {
        let (tx, rx) = match capacity {
            Some(n) => {
                let (tx, rx) = mpsc::channel(n.max(1));
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
        };
        let completed = CancellationToken::new();
        let drained = CancellationToken::new();

        let _ = tokio::spawn(write_loop(
            transport,
            rx,
            clock,
            completed.clone(),
            drained.clone(),
        ));

        Self {
            tx,
            completed,
            drained,
        }
    }

    /// Enqueue without waiting. Fails when the writer is complete or a
    /// bounded queue is full.
    pub fn post(&self, message: OperationMessage) -> Result<(), WriterError> {
        self.try_enqueue(Outbound::Message(message))
    }

    /// Enqueue, waiting for room in a bounded queue.
    pub async fn send(&self, message: OperationMessage) -> Result<(), WriterError> {
        self.enqueue(Outbound::Message(message)).await
    }

    /// Enqueue a close frame. Messages queued after it are dropped.
    pub async fn close(&self, reason: CloseReason) -> Result<(), WriterError> {
        self.enqueue(Outbound::Close(reason)).await
    }

    /// Stop accepting messages; the task drains what is queued and exits.
    pub fn complete(&self) {
        self.completed.cancel();
    }

    /// Whether `complete()` has been called.
    pub fn is_complete(&self) -> bool {
        self.completed.is_cancelled()
    }

    /// Resolves once the queue is drained and the task has exited.
    pub async fn completion(&self) {
        self.drained.cancelled().await;
    }

    /// Whether the task has exited.
    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    fn try_enqueue(&self, item: Outbound) -> Result<(), WriterError> {
        if self.is_complete() {
            return Err(WriterError::Closed);
        }
        match &self.tx {
            QueueTx::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WriterError::Full,
                mpsc::error::TrySendError::Closed(_) => WriterError::Closed,
            }),
            QueueTx::Unbounded(tx) => tx.send(item).map_err(|_| WriterError::Closed),
        }
    }

    async fn enqueue(&self, item: Outbound) -> Result<(), WriterError> {
        if self.is_complete() {
            return Err(WriterError::Closed);
        }
        match &self.tx {
            QueueTx::Bounded(tx) => tokio::select! {
                biased;
                () = self.completed.cancelled() => Err(WriterError::Closed),
                sent = tx.send(item) => sent.map_err(|_| WriterError::Closed),
            },
            QueueTx::Unbounded(tx) => tx.send(item).map_err(|_| WriterError::Closed),
        }
    }
}

async fn write_loop<T: Transport>(
    mut transport: T,
    mut rx: QueueRx,
    clock: ActivityClock,
    completed: CancellationToken,
    drained: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(item) => write_one(&mut transport, &clock, item).await,
                None => break,
            },
            () = completed.cancelled() => {
                rx.close();
                while let Some(item) = rx.recv().await {
                    write_one(&mut transport, &clock, item).await;
                }
                break;
            }
        }
    }
    debug!("writer drained");
    drained.cancel();
}

async fn write_one<T: Transport>(transport: &mut T, clock: &ActivityClock, item: Outbound) {
    if transport.is_closed() {
        counter!(WRITER_DROPPED_MESSAGES_TOTAL).increment(1);
        debug!(?item, "transport closed, dropping outbound item");
        return;
    }
    match item {
        Outbound::Message(message) => {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound message");
                    return;
                }
            };
            match transport.send_text(text).await {
                Ok(()) => clock.touch(),
                Err(e) => {
                    counter!(WRITER_DROPPED_MESSAGES_TOTAL).increment(1);
                    debug!(error = %e, "write failed, dropping message");
                }
            }
        }
        Outbound::Close(reason) => {
            debug!(%reason, "closing transport");
            if let Err(e) = transport.close(reason.code, &reason.reason).await {
                debug!(error = %e, "close frame not delivered");
            }
        }
    }
}
