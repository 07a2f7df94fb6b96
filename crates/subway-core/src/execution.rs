//! What a request executor returns.

use std::fmt;
use std::pin::Pin;

use futures::Stream;
use serde_json::{Map, Value};

use crate::errors::ExecutionError;

/// Stream of results for a long-lived operation.
///
/// `Err` items are error events; the stream may keep producing after one.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<ExecutionResult, ExecutionError>> + Send + 'static>>;

/// A single result: data, errors, or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    /// Result data.
    pub data: Option<Value>,
    /// Errors raised while producing `data`.
    pub errors: Vec<ExecutionError>,
}

impl ExecutionResult {
    /// Successful result.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Failed result.
    pub fn errors(errors: Vec<ExecutionError>) -> Self {
        Self { data: None, errors }
    }

    /// Whether any errors were reported.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Wire payload: `{ "data"?, "errors"? }`.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::new();
        if let Some(data) = &self.data {
            let _ = map.insert("data".into(), data.clone());
        }
        if !self.errors.is_empty() {
            let errors = self.errors.iter().map(ExecutionError::to_payload).collect();
            let _ = map.insert("errors".into(), Value::Array(errors));
        }
        Value::Object(map)
    }
}

/// Outcome of executing a decoded operation.
pub enum ExecutionOutcome {
    /// The operation ran to completion and produced one result.
    Single(ExecutionResult),
    /// The operation is a subscription backed by exactly one event stream.
    Stream(EventStream),
    /// The operation could not be executed (e.g. validation failed).
    Rejected(Vec<ExecutionError>),
}

impl fmt::Debug for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(result) => f.debug_tuple("Single").field(result).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Rejected(errors) => f.debug_tuple("Rejected").field(errors).finish(),
        }
    }
}
