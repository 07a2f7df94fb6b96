//! The request-execution seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use subway_auth::Identity;
use subway_core::ExecutionOutcome;
use tokio_util::sync::CancellationToken;

use crate::errors::RequestError;

/// A decoded `start` ready for execution.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Client-assigned operation id.
    pub id: String,
    /// The `start` payload (query, variables, operation name).
    pub payload: Option<Value>,
    /// Who is calling.
    pub identity: Arc<Identity>,
    /// Cancelled when the connection is torn down.
    pub cancel: CancellationToken,
}

impl OperationRequest {
    /// `payload.query` as a string, if present.
    pub fn query(&self) -> Option<&str> {
        self.payload.as_ref()?.get("query")?.as_str()
    }

    /// `payload.variables`, if present.
    pub fn variables(&self) -> Option<&Value> {
        self.payload.as_ref()?.get("variables")
    }

    /// `payload.operationName`, if present.
    pub fn operation_name(&self) -> Option<&str> {
        self.payload.as_ref()?.get("operationName")?.as_str()
    }
}

/// Executes operations.
///
/// Return [`ExecutionOutcome::Stream`] for subscriptions, a single result for
/// anything else, or [`ExecutionOutcome::Rejected`] when the operation cannot
/// run at all. Implementations should honor `request.cancel` and return
/// [`RequestError::Cancelled`] when it fires.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Execute one operation.
    async fn execute(&self, request: OperationRequest) -> Result<ExecutionOutcome, RequestError>;
}
