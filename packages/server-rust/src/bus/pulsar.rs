//! Pulsar producer over the binary protocol.
//!
//! The client connects lazily on the first producer creation and is shared by
//! every topic. Topics are published as
//! `persistent://<tenant>/<namespace>/<topic>`. A publish only holds the
//! producer lock while the message is queued on the connection; the broker
//! receipt is awaited outside it, so concurrent sends on one topic pipeline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pulsar::producer::Producer;
use pulsar::{Authentication, Pulsar, TokioExecutor};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::{BusError, MessageBus, TopicProducer};

/// Connection settings for a Pulsar cluster.
#[derive(Debug, Clone)]
pub struct PulsarConfig {
    /// Service URL: `pulsar://` or `pulsar+ssl://`.
    pub url: String,
    /// Optional JWT presented with the `token` auth method.
    pub token: Option<String>,
    pub tenant: String,
    pub namespace: String,
    /// Maximum wait for connecting, creating a producer, or a send receipt.
    pub publish_timeout: Duration,
}

impl PulsarConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            tenant: "public".to_string(),
            namespace: "default".to_string(),
            publish_timeout: Duration::from_secs(30),
        }
    }
}

/// [`MessageBus`] backed by a shared Pulsar client.
pub struct PulsarBus {
    url: String,
    token: Option<String>,
    tenant: String,
    namespace: String,
    publish_timeout: Duration,
    client: OnceCell<Pulsar<TokioExecutor>>,
}

impl fmt::Debug for PulsarBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulsarBus")
            .field("url", &self.url)
            .field("tenant", &self.tenant)
            .field("namespace", &self.namespace)
            .field("connected", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

impl PulsarBus {
    /// Validates the configuration. No connection is made until a producer
    /// is created.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidUrl`] for an unparsable URL or a scheme other
    /// than `pulsar`/`pulsar+ssl`, and [`BusError::InvalidToken`] for a blank
    /// token.
    pub fn new(config: PulsarConfig) -> Result<Self, BusError> {
        let url = validate_service_url(&config.url)?;
        if config.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(BusError::InvalidToken);
        }
        Ok(Self {
            url,
            token: config.token,
            tenant: config.tenant,
            namespace: config.namespace,
            publish_timeout: config.publish_timeout,
            client: OnceCell::new(),
        })
    }

    /// Fully qualified topic name for `topic`.
    #[must_use]
    pub fn topic_name(&self, topic: &str) -> String {
        format!("persistent://{}/{}/{}", self.tenant, self.namespace, topic)
    }

    async fn client(&self) -> Result<&Pulsar<TokioExecutor>, BusError> {
        self.client
            .get_or_try_init(|| async {
                let mut builder = Pulsar::builder(self.url.clone(), TokioExecutor);
                if let Some(token) = &self.token {
                    builder = builder.with_auth(Authentication {
                        name: "token".to_string(),
                        data: token.clone().into_bytes(),
                    });
                }
                let client = builder.build().await?;
                info!(url = %self.url, "Pulsar client connected");
                Ok::<_, BusError>(client)
            })
            .await
    }
}

#[async_trait]
impl MessageBus for PulsarBus {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BusError> {
        let name = self.topic_name(topic);
        let build = async {
            let client = self.client().await?;
            let producer = client.producer().with_topic(name.as_str()).build().await?;
            Ok::<_, BusError>(producer)
        };
        let producer = tokio::time::timeout(self.publish_timeout, build)
            .await
            .map_err(|_| timed_out(self.publish_timeout))??;
        debug!(topic = %name, "Producer created");

        Ok(Arc::new(PulsarProducer {
            topic: topic.to_string(),
            publish_timeout: self.publish_timeout,
            inner: Mutex::new(producer),
        }))
    }
}

struct PulsarProducer {
    topic: String,
    publish_timeout: Duration,
    inner: Mutex<Producer<TokioExecutor>>,
}

#[async_trait]
impl TopicProducer for PulsarProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, payload: Bytes) -> Result<(), BusError> {
        let publish = async {
            let receipt = {
                let mut producer = self.inner.lock().await;
                producer.send_non_blocking(payload.to_vec()).await?
            };
            receipt.await?;
            Ok::<_, BusError>(())
        };
        tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| timed_out(self.publish_timeout))?
    }
}

fn timed_out(limit: Duration) -> BusError {
    BusError::Timeout {
        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Checks the service URL has a Pulsar binary-protocol scheme and a host.
/// Returns it without a trailing slash.
fn validate_service_url(url: &str) -> Result<String, BusError> {
    let invalid = |reason: &str| BusError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: http::Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
    match uri.scheme_str() {
        Some("pulsar" | "pulsar+ssl") => {}
        Some(_) => return Err(invalid("expected a pulsar:// or pulsar+ssl:// URL")),
        None => return Err(invalid("missing scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url.trim_end_matches('/').to_string())
}
