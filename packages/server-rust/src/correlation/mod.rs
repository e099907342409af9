//! Correlation registry linking in-flight client requests to worker results.
//!
//! Two independent tables, each behind its own reader/writer lock:
//!
//! - [`ResultTable`]: one `oneshot` hand-off per non-streaming request
//! - [`StreamTable`]: one bounded frame channel per streaming request
//!
//! Locks are held only for O(1) map operations; channel sends always happen
//! after the guard is released. Consumers hold RAII registrations that remove
//! their entry on drop, so the tables never outgrow the in-flight set.

pub mod results;
pub mod streams;

use std::sync::Arc;

pub use results::{PendingResult, ResultTable, WaitError};
pub use streams::{AbortReason, StreamFrame, StreamSubscription, StreamTable};

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("request id {request_id} is already registered")]
    Duplicate { request_id: String },
}

/// Outcome of a worker trying to deliver into a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("request id not found")]
    NotFound,
    #[error("the waiting client already left")]
    ConsumerGone,
    #[error("the client stream buffer stayed full")]
    SlowConsumer,
}

/// Both correlation tables, shared by the ingress and callback handlers.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    results: Arc<ResultTable>,
    streams: Arc<StreamTable>,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a non-streaming request.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] if the id is live in either table.
    pub fn register_result(&self, request_id: &str) -> Result<PendingResult, CorrelationError> {
        if self.streams.contains(request_id) {
            return Err(CorrelationError::Duplicate {
                request_id: request_id.to_string(),
            });
        }
        self.results.register(request_id)
    }

    /// Registers a streaming request with room for `buffer` pending frames.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] if the id is live in either table.
    pub fn register_stream(
        &self,
        request_id: &str,
        buffer: usize,
    ) -> Result<StreamSubscription, CorrelationError> {
        if self.results.contains(request_id) {
            return Err(CorrelationError::Duplicate {
                request_id: request_id.to_string(),
            });
        }
        self.streams.register(request_id, buffer)
    }

    #[must_use]
    pub fn results(&self) -> &ResultTable {
        &self.results
    }

    #[must_use]
    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }
}
