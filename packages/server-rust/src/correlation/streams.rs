//! Streaming correlation table.
//!
//! Each entry holds the sending half of a bounded, ordered frame channel.
//! The worker socket looks the sender up under the read lock, clones it, and
//! sends after the lock is released. `End` claims the entry so the stream
//! cannot be terminated twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::{CorrelationError, DeliveryError};

/// One item on a stream's hand-off channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A payload chunk to forward as one event.
    Chunk(Bytes),
    /// The worker sent `end=true`.
    End,
    /// The stream was cut off by the gateway.
    Abort(AbortReason),
}

/// Why the gateway cut a stream off before the worker ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The worker connection that was feeding the stream closed.
    WorkerDisconnected,
    /// The client could not keep up and the stream buffer stayed full.
    SlowConsumer,
}

impl AbortReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkerDisconnected => "worker connection closed before the stream ended",
            Self::SlowConsumer => "client could not keep up with the stream",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table of streaming requests awaiting worker chunks.
#[derive(Debug, Default)]
pub struct StreamTable {
    entries: RwLock<HashMap<String, mpsc::Sender<StreamFrame>>>,
}

impl StreamTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id with a channel holding up to `buffer` frames.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] if the id is already registered.
    pub fn register(
        self: &Arc<Self>,
        request_id: &str,
        buffer: usize,
    ) -> Result<StreamSubscription, CorrelationError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        {
            let mut entries = self.entries.write();
            if entries.contains_key(request_id) {
                return Err(CorrelationError::Duplicate {
                    request_id: request_id.to_string(),
                });
            }
            entries.insert(request_id.to_string(), tx);
        }
        Ok(StreamSubscription {
            request_id: request_id.to_string(),
            rx,
            table: Arc::clone(self),
        })
    }

    /// Returns a sender for `request_id`, if registered.
    #[must_use]
    pub fn lookup(&self, request_id: &str) -> Option<mpsc::Sender<StreamFrame>> {
        self.entries.read().get(request_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.read().contains_key(request_id)
    }

    /// Forwards one chunk, waiting at most `timeout` for buffer space.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`] for unknown ids, [`DeliveryError::ConsumerGone`]
    /// when the client side already exited, and [`DeliveryError::SlowConsumer`]
    /// when the buffer stayed full; in that case the stream is aborted.
    pub async fn send_chunk(
        &self,
        request_id: &str,
        chunk: Bytes,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let tx = self.lookup(request_id).ok_or(DeliveryError::NotFound)?;
        match tx.send_timeout(StreamFrame::Chunk(chunk), timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => {
                self.unregister(request_id);
                Err(DeliveryError::ConsumerGone)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.abort(request_id, AbortReason::SlowConsumer);
                Err(DeliveryError::SlowConsumer)
            }
        }
    }

    /// Terminates the stream for `request_id` and releases its entry.
    ///
    /// # Errors
    ///
    /// Same classification as [`StreamTable::send_chunk`]. Once the entry is
    /// claimed it is gone from the table regardless of the outcome, so a
    /// consumer that misses `End` observes a closed channel instead.
    pub async fn end(&self, request_id: &str, timeout: Duration) -> Result<(), DeliveryError> {
        let tx = self
            .entries
            .write()
            .remove(request_id)
            .ok_or(DeliveryError::NotFound)?;
        match tx.send_timeout(StreamFrame::End, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::ConsumerGone),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::SlowConsumer),
        }
    }

    /// Removes the entry and signals `reason` to the consumer.
    ///
    /// If the buffer is full the abort frame is dropped; the consumer still
    /// sees the channel close once it drains, which it treats as an abort.
    /// Returns `true` if the entry was present.
    pub fn abort(&self, request_id: &str, reason: AbortReason) -> bool {
        let Some(tx) = self.entries.write().remove(request_id) else {
            return false;
        };
        let _ = tx.try_send(StreamFrame::Abort(reason));
        true
    }

    /// Removes the entry for `request_id`. Returns `true` if it was present.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.entries.write().remove(request_id).is_some()
    }

    /// Number of streams currently open.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Consumer side of a streaming registration.
#[derive(Debug)]
pub struct StreamSubscription {
    request_id: String,
    rx: mpsc::Receiver<StreamFrame>,
    table: Arc<StreamTable>,
}

impl StreamSubscription {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Receives the next frame. `None` means every sender is gone without an
    /// `End` frame having been delivered.
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.table.unregister(&self.request_id);
    }
}
