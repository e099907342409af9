//! In-memory bus that records every published message.
//!
//! Test harnesses read published tasks from the receiver returned by
//! [`InMemoryBus::new`] and play the worker role against the callback
//! endpoints. Producer creation can be made to fail per topic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BusError, MessageBus, TopicProducer};

/// A message captured by the in-memory bus.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct InMemoryBus {
    tx: mpsc::UnboundedSender<PublishedMessage>,
    created: AtomicUsize,
    failing_topics: Mutex<HashSet<String>>,
}

impl InMemoryBus {
    /// Creates the bus and the receiver that observes every publish.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            tx,
            created: AtomicUsize::new(0),
            failing_topics: Mutex::new(HashSet::new()),
        };
        (bus, rx)
    }

    /// Makes producer creation for `topic` fail until healed.
    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().insert(topic.to_string());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.failing_topics.lock().remove(topic);
    }

    /// Number of producers created so far, across all topics.
    #[must_use]
    pub fn producers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BusError> {
        if self.failing_topics.lock().contains(topic) {
            return Err(BusError::Unavailable {
                topic: topic.to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryProducer {
            topic: topic.to_string(),
            tx: self.tx.clone(),
        }))
    }
}

#[derive(Debug)]
struct InMemoryProducer {
    topic: String,
    tx: mpsc::UnboundedSender<PublishedMessage>,
}

#[async_trait]
impl TopicProducer for InMemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, payload: Bytes) -> Result<(), BusError> {
        self.tx
            .send(PublishedMessage {
                topic: self.topic.clone(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }
}
