//! Logging setup and Prometheus metrics.
//!
//! # Metrics
//! - `taskgate_completions_total` (counter): completions by `kind` and `outcome`
//! - `taskgate_result_wait_seconds` (histogram): time a single-shot request
//!   waited for its worker result
//! - `taskgate_callbacks_total` (counter): worker deliveries by `channel` and
//!   `outcome`
//! - `taskgate_publish_failures_total` (counter)
//! - `taskgate_streams_ended_total` (counter): stream terminations by `reason`
//! - `taskgate_worker_connections` (gauge)

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::network::DispatchKind;

const DEBUG_FILTER: &str = "taskgate_server=debug,taskgate=debug,tower_http=debug,info";
const RELEASE_FILTER: &str = "info";

/// Installs the global tracing subscriber.
///
/// Debug mode logs human-readable lines; otherwise one JSON object per event.
/// `RUST_LOG` overrides the default filter in both modes.
pub fn init_logging(debug: bool) {
    let default_filter = if debug { DEBUG_FILTER } else { RELEASE_FILTER };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if debug {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    }
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// # Errors
///
/// Fails if a recorder is already installed or the listener cannot bind.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn kind_label(kind: DispatchKind) -> &'static str {
    match kind {
        DispatchKind::Single => "single",
        DispatchKind::Stream => "stream",
    }
}

pub fn completion_finished(kind: DispatchKind, outcome: &'static str) {
    metrics::counter!(
        "taskgate_completions_total",
        "kind" => kind_label(kind),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn result_waited(elapsed: Duration) {
    metrics::histogram!("taskgate_result_wait_seconds").record(elapsed.as_secs_f64());
}

/// `channel` is `http` for `/res` and `ws` for `/res/ws`.
pub fn callback_received(channel: &'static str, outcome: &'static str) {
    metrics::counter!(
        "taskgate_callbacks_total",
        "channel" => channel,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn publish_failed() {
    metrics::counter!("taskgate_publish_failures_total").increment(1);
}

pub fn stream_ended(reason: &'static str) {
    metrics::counter!("taskgate_streams_ended_total", "reason" => reason).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub fn worker_connections(count: usize) {
    metrics::gauge!("taskgate_worker_connections").set(count as f64);
}
