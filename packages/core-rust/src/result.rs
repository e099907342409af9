//! Result frames reported by workers.
//!
//! Workers answer a non-streaming task with one [`TaskResult`] posted to the
//! HTTP callback, and a streaming task with a sequence of [`TaskStreamResult`]
//! frames over the shared WebSocket callback.

use serde::Deserialize;
use serde_json::value::RawValue;

/// Single-shot worker response.
#[derive(Debug, Deserialize)]
pub struct TaskResult {
    pub request_id: String,
    /// Any JSON value; absent or `null` delivers the literal `null`.
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl TaskResult {
    /// Returns the bytes forwarded to the waiting client.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        self.data
            .as_deref()
            .map_or_else(|| b"null".to_vec(), payload_bytes)
    }
}

/// One frame of a streamed worker response.
#[derive(Debug, Deserialize)]
pub struct TaskStreamResult {
    pub request_id: String,
    /// Terminates the logical stream for `request_id`.
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl TaskStreamResult {
    /// Returns the chunk carried by this frame, if any.
    #[must_use]
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.data.as_deref().map(payload_bytes)
    }
}

/// Normalizes a result value into the bytes delivered to the client.
///
/// A JSON string is unwrapped to its contents, so a worker may send an
/// already-encoded document as a string. Any other value is forwarded as its
/// JSON text.
#[must_use]
pub fn payload_bytes(raw: &RawValue) -> Vec<u8> {
    let text = raw.get();
    if text.starts_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(text) {
            return inner.into_bytes();
        }
    }
    text.as_bytes().to_vec()
}
