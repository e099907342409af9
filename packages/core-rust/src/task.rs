//! Task envelope published to the message bus.
//!
//! A `Task` is built once per client request, serialized to JSON and handed to
//! a topic producer. The gateway keeps no copy of it after publishing; only
//! the `request_id` survives as the correlation key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Prefix applied to the work target to derive the bus topic.
pub const MODEL_TOPIC_PREFIX: &str = "model-";

/// Returns the bus topic that serves the given work target.
///
/// ```
/// assert_eq!(taskgate_core::topic_for_model("alpha"), "model-alpha");
/// ```
#[must_use]
pub fn topic_for_model(model: &str) -> String {
    format!("{MODEL_TOPIC_PREFIX}{model}")
}

/// Pass-through context a worker may read but never writes back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Original client request headers, multi-valued, keyed by lowercase name.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

impl TaskMetadata {
    /// Builds metadata from `(name, value)` header pairs, grouping repeated names.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            grouped.entry(name.into()).or_default().push(value.into());
        }
        Self { headers: grouped }
    }
}

/// Unit of work published to the bus for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque correlation key minted by the gateway.
    pub request_id: String,
    /// Whether the worker must answer over the streaming callback.
    pub stream: bool,
    /// The client body, embedded verbatim.
    pub data: Box<RawValue>,
    /// Callback address the worker reports results to.
    pub endpoint: String,
    /// Read-only request context.
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl Task {
    /// Serializes the task into the bytes published on the bus.
    ///
    /// # Errors
    ///
    /// Returns an error only if serialization of the embedded payload fails,
    /// which cannot happen for a `RawValue` produced by `serde_json`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
