//! Worker connection tracking for the streaming callback socket.
//!
//! Every `/res/ws` connection is registered here with a bounded control
//! channel and the set of stream ids it has fed. The set lets the socket task
//! abort unfinished streams when the worker goes away, and the control channel
//! lets shutdown close every worker socket.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Unique identifier for a worker connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control message for a worker socket's write side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Close the socket with an optional reason.
    Close(Option<String>),
}

/// Handle to one worker streaming connection.
#[derive(Debug)]
pub struct WorkerConnection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundMessage>,
    streams: Mutex<HashSet<String>>,
}

impl WorkerConnection {
    /// Enqueues a control message without blocking.
    ///
    /// Returns `false` if the channel is full or the socket task has exited.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Records that this connection delivered into `request_id`'s stream.
    pub fn track_stream(&self, request_id: &str) {
        let mut streams = self.streams.lock();
        if !streams.contains(request_id) {
            streams.insert(request_id.to_string());
        }
    }

    /// Forgets `request_id` once its stream has ended.
    pub fn finish_stream(&self, request_id: &str) {
        self.streams.lock().remove(request_id);
    }

    /// Removes and returns every stream still tracked by this connection.
    #[must_use]
    pub fn take_streams(&self) -> Vec<String> {
        self.streams.lock().drain().collect()
    }

    /// Streams fed by this connection that have not ended yet.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

/// Concurrent registry of live worker connections.
#[derive(Debug)]
pub struct WorkerConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<WorkerConnection>>,
    next_id: AtomicU64,
}

impl WorkerConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection and returns its handle plus the control
    /// receiver for the socket's write side.
    pub fn register(
        &self,
        peer: Option<SocketAddr>,
        config: &ConnectionConfig,
    ) -> (Arc<WorkerConnection>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));

        let handle = Arc::new(WorkerConnection {
            id,
            peer,
            connected_at: Instant::now(),
            tx,
            streams: Mutex::new(HashSet::new()),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<WorkerConnection>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns all connections. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<WorkerConnection>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for WorkerConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
