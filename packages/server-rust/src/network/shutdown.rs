//! Graceful shutdown controller with in-flight dispatch tracking.
//!
//! Health state lives in an `ArcSwap`; in-flight completions are counted per
//! kind with RAII guards so the drain wait and `/health` see accurate numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

/// Server health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Ready,
    /// Shutdown was requested; open requests are finishing.
    Draining,
    Stopped,
}

/// Which response path an in-flight completion is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Single,
    Stream,
}

#[derive(Debug, Default)]
struct InFlight {
    single: AtomicU64,
    stream: AtomicU64,
}

impl InFlight {
    fn counter(&self, kind: DispatchKind) -> &AtomicU64 {
        match kind {
            DispatchKind::Single => &self.single,
            DispatchKind::Stream => &self.stream,
        }
    }

    fn total(&self) -> u64 {
        self.single.load(Ordering::Relaxed) + self.stream.load(Ordering::Relaxed)
    }
}

/// Coordinates shutdown across the server.
///
/// `trigger_shutdown()` moves to `Draining` and flips the watch signal that
/// stream pumps and the server select on; `wait_for_drain()` then waits for
/// the in-flight guards to drop.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(InFlight::default()),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and notifies every shutdown receiver.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        // send_replace never fails, even with no receivers.
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Counts one in-flight completion of `kind` until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self, kind: DispatchKind) -> InFlightGuard {
        self.in_flight.counter(kind).fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            kind,
        }
    }

    /// Total in-flight completions across both kinds.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.total()
    }

    /// In-flight completions of one kind.
    #[must_use]
    pub fn in_flight_of(&self, kind: DispatchKind) -> u64 {
        self.in_flight.counter(kind).load(Ordering::Relaxed)
    }

    /// Waits until nothing is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on a clean drain. On timeout the
    /// state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.total() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements its in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
    kind: DispatchKind,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .counter(self.kind)
            .fetch_sub(1, Ordering::Relaxed);
    }
}
