//! Keep-alive scheduling for initialized connections.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use subway_settings::KeepAliveMode;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::KEEP_ALIVES_SENT_TOTAL;
use crate::transport::ActivityClock;

/// Why the keep-alive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveResult {
    /// The connection was torn down.
    Cancelled,
    /// The writer stopped accepting messages.
    WriterClosed,
}

/// Run keep-alives until `cancel` fires or `send` reports the writer closed.
///
/// `Fixed` waits one `interval` before every send. `IdleAdaptive`
/// sends only when neither a keep-alive nor any other write (per `clock`)
/// happened during the last `interval`, sleeping for the remainder otherwise.
pub async fn run_keep_alive<F, Fut>(
    mode: KeepAliveMode,
    interval: Duration,
    clock: ActivityClock,
    cancel: CancellationToken,
    mut send: F,
) -> KeepAliveResult
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    let mut last_keep_alive = Instant::now();
    loop {
        let wait = match mode {
            KeepAliveMode::Fixed => interval,
            KeepAliveMode::IdleAdaptive => {
                let last = clock.last().max(last_keep_alive);
                let idle = Instant::now().saturating_duration_since(last);
                if idle >= interval {
                    if !send().await {
                        return KeepAliveResult::WriterClosed;
                    }
                    counter!(KEEP_ALIVES_SENT_TOTAL).increment(1);
                    last_keep_alive = Instant::now();
                    interval
                } else {
                    interval - idle
                }
            }
        };

        tokio::select! {
            () = cancel.cancelled() => {
                debug!("keep-alive cancelled");
                return KeepAliveResult::Cancelled;
            }
            () = time::sleep(wait) => {}
        }

        if matches!(mode, KeepAliveMode::Fixed) {
            if !send().await {
                return KeepAliveResult::WriterClosed;
            }
            counter!(KEEP_ALIVES_SENT_TOTAL).increment(1);
        }
    }
}
