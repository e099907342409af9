//! Message bus seam: producer creation, publishing, and the topic cache.
//!
//! The gateway only publishes. [`MessageBus`] creates one [`TopicProducer`]
//! per topic; [`ProducerCache`] keeps those handles for the process lifetime.
//! Implementations: Pulsar over its binary protocol, and an in-memory
//! recorder used by tests.

pub mod cache;
pub mod memory;
pub mod pulsar;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use cache::ProducerCache;
pub use memory::{InMemoryBus, PublishedMessage};
pub use pulsar::{PulsarBus, PulsarConfig};

/// Creates publish handles against a topic-based bus.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Opens a producer for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the bus rejects or cannot reach the topic.
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BusError>;
}

/// Durable publish handle bound to one topic.
#[async_trait]
pub trait TopicProducer: Send + Sync {
    fn topic(&self) -> &str;

    /// Publishes `payload` and waits for the bus to accept it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the message was not acknowledged.
    async fn send(&self, payload: Bytes) -> Result<(), BusError>;
}

/// Errors surfaced by bus implementations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid bus token")]
    InvalidToken,
    #[error("pulsar client error: {0}")]
    Client(#[source] Box<pulsar::Error>),
    #[error("bus connection closed")]
    Closed,
    #[error("no acknowledgement within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("producer unavailable for topic {topic}")]
    Unavailable { topic: String },
}

impl From<pulsar::Error> for BusError {
    fn from(err: pulsar::Error) -> Self {
        Self::Client(Box::new(err))
    }
}
