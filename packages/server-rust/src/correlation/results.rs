//! Single-result correlation table.
//!
//! Each entry holds the sending half of a `oneshot` channel. Delivery claims
//! the sender under the write lock and sends after releasing it, so a worker
//! callback never blocks and at most one delivery per request id succeeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use super::{CorrelationError, DeliveryError};

/// Table of non-streaming requests awaiting a worker result.
#[derive(Debug, Default)]
pub struct ResultTable {
    entries: RwLock<HashMap<String, oneshot::Sender<Bytes>>>,
}

/// Why a wait for a single result ended without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no result before the deadline")]
    TimedOut,
    #[error("result channel closed without a value")]
    Closed,
}

impl ResultTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id and returns the consumer half.
    ///
    /// The returned [`PendingResult`] removes the entry when dropped, so every
    /// exit path of the waiting handler cleans up after itself.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] if the id is already registered.
    pub fn register(self: &Arc<Self>, request_id: &str) -> Result<PendingResult, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.write();
            if entries.contains_key(request_id) {
                return Err(CorrelationError::Duplicate {
                    request_id: request_id.to_string(),
                });
            }
            entries.insert(request_id.to_string(), tx);
        }
        Ok(PendingResult {
            request_id: request_id.to_string(),
            rx,
            table: Arc::clone(self),
        })
    }

    /// Returns `true` if a consumer is registered under `request_id`.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.read().contains_key(request_id)
    }

    /// Hands `payload` to the consumer waiting on `request_id`.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NotFound`] when no consumer is registered (never was,
    /// already answered, or already timed out); [`DeliveryError::ConsumerGone`]
    /// when the consumer left between the claim and the send.
    pub fn deliver(&self, request_id: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let tx = self
            .entries
            .write()
            .remove(request_id)
            .ok_or(DeliveryError::NotFound)?;
        tx.send(payload).map_err(|_| DeliveryError::ConsumerGone)
    }

    /// Removes the entry for `request_id`. Returns `true` if it was present.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.entries.write().remove(request_id).is_some()
    }

    /// Number of requests currently waiting for a result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Consumer side of a single-result registration.
#[derive(Debug)]
pub struct PendingResult {
    request_id: String,
    rx: oneshot::Receiver<Bytes>,
    table: Arc<ResultTable>,
}

impl PendingResult {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits up to `deadline` for the worker's payload.
    ///
    /// On expiry the entry is removed before reporting a timeout. If a
    /// delivery already claimed the entry, its send is synchronous and
    /// imminent, so the claimed payload is awaited and wins. A worker sees
    /// 200 exactly when the client does.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] when the deadline elapses with no
    /// payload, and [`WaitError::Closed`] if the sender was dropped unused.
    pub async fn wait(&mut self, deadline: Duration) -> Result<Bytes, WaitError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_elapsed) => {
                if self.table.unregister(&self.request_id) {
                    return Err(WaitError::TimedOut);
                }
                (&mut self.rx).await.map_err(|_| WaitError::Closed)
            }
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        self.table.unregister(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<ResultTable> {
        Arc::new(ResultTable::new())
    }

    #[tokio::test]
    async fn delivered_payload_reaches_waiter() {
        let table = table();
        let mut pending = table.register("R").unwrap();
        assert!(table.contains("R"));

        table.deliver("R", Bytes::from_static(b"{\"ok\":true}")).unwrap();
        let payload = pending.wait(Duration::from_secs(1)).await.unwrap();

        assert_eq!(&payload[..], b"{\"ok\":true}");
        drop(pending);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn delivery_for_unknown_id_is_not_found() {
        let table = table();
        assert_eq!(
            table.deliver("missing", Bytes::new()),
            Err(DeliveryError::NotFound)
        );
    }

    #[tokio::test]
    async fn second_delivery_is_not_found() {
        let table = table();
        let _pending = table.register("R").unwrap();
        table.deliver("R", Bytes::from_static(b"1")).unwrap();
        assert_eq!(
            table.deliver("R", Bytes::from_static(b"2")),
            Err(DeliveryError::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_unregisters_and_late_delivery_is_not_found() {
        let table = table();
        let mut pending = table.register("R").unwrap();

        let err = pending.wait(Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
        assert!(!table.contains("R"));

        assert_eq!(
            table.deliver("R", Bytes::from_static(b"late")),
            Err(DeliveryError::NotFound)
        );
    }

    #[tokio::test]
    async fn dropping_pending_unregisters() {
        let table = table();
        let pending = table.register("R").unwrap();
        assert_eq!(table.len(), 1);
        drop(pending);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = table();
        let _pending = table.register("R").unwrap();
        assert!(matches!(
            table.register("R"),
            Err(CorrelationError::Duplicate { .. })
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let table = table();
        let pending = table.register("R").unwrap();
        assert!(table.unregister("R"));
        assert!(!table.unregister("R"));
        drop(pending);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_sender_wins_over_expired_deadline() {
        let table = table();
        let mut pending = table.register("R").unwrap();
        // Claimed but not yet sent, as inside `deliver`.
        let tx = table.entries.write().remove("R").unwrap();

        let waiter = tokio::spawn(async move { pending.wait(Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());

        assert!(tx.send(Bytes::from_static(b"raced")).is_ok());
        let payload = waiter.await.unwrap().unwrap();
        assert_eq!(&payload[..], b"raced");
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_sender_dropped_after_deadline_is_closed() {
        let table = table();
        let mut pending = table.register("R").unwrap();
        let tx = table.entries.write().remove("R").unwrap();

        let waiter = tokio::spawn(async move { pending.wait(Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(tx);

        assert_eq!(waiter.await.unwrap(), Err(WaitError::Closed));
    }

    #[tokio::test]
    async fn delivery_after_claim_but_before_wait_is_kept() {
        let table = table();
        let mut pending = table.register("R").unwrap();
        table.deliver("R", Bytes::from_static(b"early")).unwrap();
        assert!(!table.contains("R"));

        // Deadline of zero: the value is already in the channel.
        let payload = pending.wait(Duration::ZERO).await.unwrap();
        assert_eq!(&payload[..], b"early");
    }
}
