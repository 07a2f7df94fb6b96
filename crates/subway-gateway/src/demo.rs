//! Demo executor so the gateway is usable without a schema.
//!
//! `subscription ...` documents stream `{ "tick": n }` once per tick period;
//! anything else echoes its variables as a single result. Documents that
//! mention `admin` require the `admin` role.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use subway_auth::{AuthorizationGate, AuthorizationRule};
use subway_core::{ErrorKind, ExecutionError, ExecutionOutcome, ExecutionResult};
use subway_server::{OperationRequest, RequestError, RequestExecutor};
use tokio::time::{Instant, interval_at};
use tokio_stream::wrappers::IntervalStream;
use tracing::debug;

/// Default tick period.
pub const TICK: Duration = Duration::from_secs(1);

/// Executes demo documents.
pub struct DemoExecutor {
    gate: AuthorizationGate,
    admin: AuthorizationRule,
    tick: Duration,
}

impl DemoExecutor {
    /// Executor checking `admin` documents against `gate`'s policies.
    pub fn new(gate: AuthorizationGate) -> Self {
        Self {
            gate,
            admin: AuthorizationRule::require_roles(["admin"]),
            tick: TICK,
        }
    }

    /// Override the tick period.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

#[async_trait]
impl RequestExecutor for DemoExecutor {
    async fn execute(&self, request: OperationRequest) -> Result<ExecutionOutcome, RequestError> {
        let Some(query) = request.query() else {
            return Ok(ExecutionOutcome::Rejected(vec![ExecutionError::new(
                ErrorKind::Validation,
                "Operation payload must include a query",
            )]));
        };

        if query.contains("admin") {
            self.admin.check(&self.gate, &request.identity).await?;
        }

        if query.trim_start().starts_with("subscription") {
            debug!(operation_id = %request.id, "starting tick stream");
            let mut n = 0_u64;
            let ticks = IntervalStream::new(interval_at(Instant::now() + self.tick, self.tick))
                .map(move |_| {
                    n += 1;
                    Ok::<_, ExecutionError>(ExecutionResult::data(json!({ "tick": n })))
                });
            return Ok(ExecutionOutcome::Stream(Box::pin(ticks)));
        }

        Ok(ExecutionOutcome::Single(ExecutionResult::data(json!({
            "echo": request.variables().cloned().unwrap_or(Value::Null),
            "operationName": request.operation_name(),
        }))))
    }
}
