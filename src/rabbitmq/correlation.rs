// src/rabbitmq/correlation.rs

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::broker::Delivery;
use super::errors::Result;

/// Opaque token tying a reply to the call that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoked once with the reply that carried the matching correlation id.
pub type ResponseCallback = Box<dyn FnOnce(Delivery) -> Result<()> + Send + 'static>;

/// In-flight calls sharing one reply channel.
#[derive(Default)]
pub struct PendingCalls {
    calls: HashMap<CorrelationId, ResponseCallback>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already registered; the earlier callback is kept.
    pub fn register(&mut self, correlation_id: CorrelationId, on_response: ResponseCallback) -> bool {
        if self.calls.contains_key(&correlation_id) {
            return false;
        }
        self.calls.insert(correlation_id, on_response);
        true
    }

    /// Removes and returns the callback for `correlation_id`.
    pub fn take(&mut self, correlation_id: &CorrelationId) -> Option<ResponseCallback> {
        self.calls.remove(correlation_id)
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
