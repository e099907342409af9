//! Server-sent event framing and the per-request stream pump.
//!
//! The pump turns a [`StreamSubscription`] into the response body of a
//! streaming completion. It writes one event per chunk, a keep-alive comment
//! after each quiet interval, `[DONE]` once when the worker ends the stream,
//! and an `error` event for every other way a stream can stop.

use std::convert::Infallible;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use taskgate_core::ErrorBody;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::correlation::{StreamFrame, StreamSubscription};
use crate::network::config::DispatchConfig;
use crate::network::shutdown::InFlightGuard;
use crate::observability;

const STREAM_ERROR_TYPE: &str = "stream_error";

/// One event written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(Bytes),
    Done,
    KeepAlive,
    Error(String),
}

impl SseEvent {
    /// Wire form of the event.
    ///
    /// Multi-line data is split into one `data:` field per line so a chunk
    /// containing newlines stays one event.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Data(chunk) => encode_data(chunk),
            Self::Done => Bytes::from_static(b"data: [DONE]\n\n"),
            Self::KeepAlive => Bytes::from_static(b": keep-alive\n\n"),
            Self::Error(message) => {
                let body = ErrorBody::new(message.as_str(), STREAM_ERROR_TYPE);
                let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
                let mut buf = BytesMut::with_capacity(json.len() + 20);
                buf.put_slice(b"event: error\ndata: ");
                buf.put_slice(json.as_bytes());
                buf.put_slice(b"\n\n");
                buf.freeze()
            }
        }
    }
}

/// One `data:` line per line of `chunk`. `\r\n`, `\r` and `\n` all end a
/// line, as they do for an SSE parser.
fn encode_data(chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunk.len() + 8);
    let mut rest = chunk;
    loop {
        let (line, next) = match rest.iter().position(|b| matches!(b, b'\r' | b'\n')) {
            Some(i) => {
                let crlf = rest[i] == b'\r' && rest.get(i + 1) == Some(&b'\n');
                (&rest[..i], Some(&rest[i + if crlf { 2 } else { 1 }..]))
            }
            None => (rest, None),
        };
        buf.put_slice(b"data: ");
        buf.put_slice(line);
        buf.put_u8(b'\n');
        match next {
            Some(next) => rest = next,
            None => break,
        }
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Timing bounds for one stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub keepalive_interval: Duration,
    /// Measured from the last real chunk.
    pub idle_timeout: Option<Duration>,
    /// Measured from when the stream opened.
    pub max_duration: Option<Duration>,
}

impl From<&DispatchConfig> for StreamLimits {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            idle_timeout: config.stream_idle_timeout,
            max_duration: config.stream_max_duration,
        }
    }
}

enum Wake {
    Frame(Option<StreamFrame>),
    Idle,
    MaxDuration,
    Shutdown,
    KeepAlive,
}

/// Drives one streaming response until it ends.
///
/// Dropping the pump (client went away) drops the subscription, which
/// unregisters the request id.
pub struct StreamPump {
    subscription: StreamSubscription,
    limits: StreamLimits,
    shutdown: watch::Receiver<bool>,
    opened_at: Instant,
    last_chunk_at: Instant,
    finished: bool,
    _in_flight: Option<InFlightGuard>,
}

impl StreamPump {
    #[must_use]
    pub fn new(
        subscription: StreamSubscription,
        limits: StreamLimits,
        shutdown: watch::Receiver<bool>,
        in_flight: Option<InFlightGuard>,
    ) -> Self {
        let now = Instant::now();
        Self {
            subscription,
            limits,
            shutdown,
            opened_at: now,
            last_chunk_at: now,
            finished: false,
            _in_flight: in_flight,
        }
    }

    /// Waits for the next event to write. `None` once the stream is over.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        if self.finished {
            return None;
        }

        let idle_at = self.limits.idle_timeout.map(|d| self.last_chunk_at + d);
        let max_at = self.limits.max_duration.map(|d| self.opened_at + d);

        let wake = tokio::select! {
            biased;
            // Polled before frames so a saturated stream still hits its cap.
            () = sleep_until(max_at) => Wake::MaxDuration,
            frame = self.subscription.recv() => Wake::Frame(frame),
            () = sleep_until(idle_at) => Wake::Idle,
            () = shutdown_requested(&mut self.shutdown) => Wake::Shutdown,
            () = tokio::time::sleep(self.limits.keepalive_interval) => Wake::KeepAlive,
        };

        let request_id = self.subscription.request_id();
        let event = match wake {
            Wake::Frame(Some(StreamFrame::Chunk(chunk))) => {
                self.last_chunk_at = Instant::now();
                return Some(SseEvent::Data(chunk));
            }
            Wake::KeepAlive => return Some(SseEvent::KeepAlive),
            Wake::Frame(Some(StreamFrame::End)) => {
                observability::stream_ended("done");
                SseEvent::Done
            }
            Wake::Frame(Some(StreamFrame::Abort(reason))) => {
                debug!(request_id, %reason, "Stream aborted");
                observability::stream_ended("aborted");
                SseEvent::Error(reason.to_string())
            }
            Wake::Frame(None) => {
                debug!(request_id, "Stream channel closed without end");
                observability::stream_ended("closed");
                SseEvent::Error("stream closed before the worker finished".to_string())
            }
            Wake::Idle => {
                debug!(request_id, "Stream idle timeout");
                observability::stream_ended("idle_timeout");
                SseEvent::Error("stream idle timeout".to_string())
            }
            Wake::MaxDuration => {
                debug!(request_id, "Stream exceeded maximum duration");
                observability::stream_ended("max_duration");
                SseEvent::Error("stream exceeded maximum duration".to_string())
            }
            Wake::Shutdown => {
                observability::stream_ended("shutdown");
                SseEvent::Error("server shutting down".to_string())
            }
        };
        self.finished = true;
        Some(event)
    }

    /// Converts the pump into a response body stream of encoded events.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        futures_util::stream::unfold(self, |mut pump| async move {
            let event = pump.next_event().await?;
            Some((Ok(event.encode()), pump))
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Controller gone; nothing will ever signal.
        std::future::pending::<()>().await;
    }
}
