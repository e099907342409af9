//! Topic producer cache.
//!
//! Lookups take the shared lock; inserts take the exclusive lock. The lock is
//! never held while a producer is being created, so two first callers for the
//! same topic may both create one. The later insert wins the slot and the
//! earlier handle is dropped once its caller is done with it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{BusError, MessageBus, TopicProducer};

/// Lazily populated map from topic name to publish handle. No eviction.
pub struct ProducerCache {
    bus: Arc<dyn MessageBus>,
    producers: RwLock<HashMap<String, Arc<dyn TopicProducer>>>,
}

impl ProducerCache {
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            producers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached producer for `topic`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the bus error when creation fails. Nothing is cached in
    /// that case, so the next call retries.
    pub async fn get_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BusError> {
        let cached = self.producers.read().get(topic).cloned();
        if let Some(producer) = cached {
            return Ok(producer);
        }

        let producer = self.bus.create_producer(topic).await?;
        info!(topic, "Created bus producer");

        let replaced = self
            .producers
            .write()
            .insert(topic.to_string(), Arc::clone(&producer));
        if replaced.is_some() {
            debug!(topic, "Replaced producer created by a concurrent caller");
        }
        Ok(producer)
    }

    /// Resolves the producer for `topic` and publishes `payload` through it.
    ///
    /// # Errors
    ///
    /// Returns the creation or send error.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.get_producer(topic).await?.send(payload).await
    }

    /// Number of topics with a cached producer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.read().is_empty()
    }
}

impl std::fmt::Debug for ProducerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCache")
            .field("topics", &self.producers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    fn cache() -> (Arc<InMemoryBus>, ProducerCache) {
        let (bus, _rx) = InMemoryBus::new();
        let bus = Arc::new(bus);
        let cache = ProducerCache::new(bus.clone());
        (bus, cache)
    }

    #[tokio::test]
    async fn same_topic_returns_identical_handle() {
        let (bus, cache) = cache();

        let first = cache.get_producer("model-alpha").await.unwrap();
        let second = cache.get_producer("model-alpha").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bus.producers_created(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn distinct_topics_get_distinct_handles() {
        let (bus, cache) = cache();

        let alpha = cache.get_producer("model-alpha").await.unwrap();
        let beta = cache.get_producer("model-beta").await.unwrap();

        assert!(!Arc::ptr_eq(&alpha, &beta));
        assert_eq!(alpha.topic(), "model-alpha");
        assert_eq!(beta.topic(), "model-beta");
        assert_eq!(bus.producers_created(), 2);
    }

    #[tokio::test]
    async fn failed_creation_is_not_cached_and_retries() {
        let (bus, cache) = cache();
        bus.fail_topic("model-alpha");

        assert!(cache.get_producer("model-alpha").await.is_err());
        assert!(cache.is_empty());

        bus.heal_topic("model-alpha");
        let producer = cache.get_producer("model-alpha").await.unwrap();
        assert_eq!(producer.topic(), "model-alpha");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn publish_sends_through_cached_producer() {
        let (bus, mut rx) = InMemoryBus::new();
        let cache = ProducerCache::new(Arc::new(bus));

        cache
            .publish("model-alpha", Bytes::from_static(b"one"))
            .await
            .unwrap();
        cache
            .publish("model-alpha", Bytes::from_static(b"two"))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic, "model-alpha");
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(&second.payload[..], b"two");
        assert_eq!(cache.len(), 1);
    }
}
