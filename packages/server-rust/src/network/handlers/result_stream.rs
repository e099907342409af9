//! `GET /res/ws`: multiplexed streaming worker callback.
//!
//! One socket carries frames for many request ids. Frames are applied in
//! arrival order. The socket never sends application frames; the only
//! outbound traffic is a close frame at shutdown.

use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use taskgate_core::TaskStreamResult;
use tracing::{debug, info, warn};

use super::results::delivery_label;
use super::AppState;
use crate::correlation::{AbortReason, DeliveryError};
use crate::network::{OutboundMessage, WorkerConnection};
use crate::observability;

pub async fn result_stream_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let config = &state.network.connection;
    ws.write_buffer_size(config.ws_write_buffer_size)
        .max_write_buffer_size(config.ws_max_write_buffer_size)
        .max_message_size(config.ws_max_message_size)
        .on_upgrade(move |socket| handle_worker_socket(socket, state, Some(peer)))
}

/// Runs one worker connection until it closes or shutdown closes it.
pub async fn handle_worker_socket(socket: WebSocket, state: AppState, peer: Option<SocketAddr>) {
    let (conn, mut control_rx) = state.workers.register(peer, &state.network.connection);
    observability::worker_connections(state.workers.count());
    info!(conn_id = %conn.id, ?peer, "Worker stream connected");

    let (mut sink, mut inbound) = socket.split();

    loop {
        tokio::select! {
            msg = inbound.next() => match msg {
                Some(Ok(Message::Text(text))) => apply_frame(&state, &conn, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    warn!(conn_id = %conn.id, bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(conn_id = %conn.id, error = %err, "Worker socket read failed");
                    break;
                }
            },
            Some(control) = control_rx.recv() => match control {
                OutboundMessage::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            },
        }
    }

    state.workers.remove(conn.id);
    for request_id in conn.take_streams() {
        if state
            .correlation
            .streams()
            .abort(&request_id, AbortReason::WorkerDisconnected)
        {
            warn!(conn_id = %conn.id, request_id, "Aborted stream left open by worker");
        }
    }
    observability::worker_connections(state.workers.count());
    info!(
        conn_id = %conn.id,
        peer = ?conn.peer,
        connected_secs = conn.connected_at.elapsed().as_secs(),
        "Worker stream disconnected"
    );
}

/// Applies one inbound frame: chunk first, then end.
async fn apply_frame(state: &AppState, conn: &WorkerConnection, text: &str) {
    let frame: TaskStreamResult = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(conn_id = %conn.id, error = %err, "Skipping malformed stream frame");
            observability::callback_received("ws", "bad_request");
            return;
        }
    };

    let streams = state.correlation.streams();
    let request_id = frame.request_id.as_str();
    let send_timeout = state.network.connection.send_timeout;

    if let Some(payload) = frame.payload() {
        match streams
            .send_chunk(request_id, Bytes::from(payload), send_timeout)
            .await
        {
            Ok(()) => conn.track_stream(request_id),
            Err(err) => {
                conn.finish_stream(request_id);
                log_rejected(conn, request_id, err);
                return;
            }
        }
    }

    if frame.end {
        conn.finish_stream(request_id);
        if let Err(err) = streams.end(request_id, send_timeout).await {
            log_rejected(conn, request_id, err);
            return;
        }
        debug!(conn_id = %conn.id, request_id, "Stream ended by worker");
    }
    observability::callback_received("ws", "ok");
}

fn log_rejected(conn: &WorkerConnection, request_id: &str, err: DeliveryError) {
    match err {
        DeliveryError::NotFound => {
            debug!(conn_id = %conn.id, request_id, "Stream frame for unknown request id");
        }
        DeliveryError::ConsumerGone | DeliveryError::SlowConsumer => {
            warn!(conn_id = %conn.id, request_id, reason = %err, "Stream frame dropped");
        }
    }
    observability::callback_received("ws", delivery_label(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::StreamFrame;
    use crate::network::handlers::test_support::test_state;
    use crate::network::{ConnectionConfig, DispatchConfig};

    #[tokio::test]
    async fn frames_are_forwarded_in_order() {
        let (state, _bus, _rx) = test_state(DispatchConfig::default());
        let (conn, _control) = state.workers.register(None, &ConnectionConfig::default());
        let mut sub = state.correlation.register_stream("S", 8).unwrap();

        apply_frame(&state, &conn, r#"{"request_id":"S","data":"one"}"#).await;
        assert_eq!(conn.open_streams(), 1);
        apply_frame(&state, &conn, r#"{"request_id":"S","data":"two","end":true}"#).await;
        assert_eq!(conn.open_streams(), 0);

        assert_eq!(sub.recv().await, Some(StreamFrame::Chunk(Bytes::from_static(b"one"))));
        assert_eq!(sub.recv().await, Some(StreamFrame::Chunk(Bytes::from_static(b"two"))));
        assert_eq!(sub.recv().await, Some(StreamFrame::End));
        assert!(!state.correlation.streams().contains("S"));
    }

    #[tokio::test]
    async fn frames_after_end_are_ignored() {
        let (state, _bus, _rx) = test_state(DispatchConfig::default());
        let (conn, _control) = state.workers.register(None, &ConnectionConfig::default());
        let mut sub = state.correlation.register_stream("S", 8).unwrap();

        apply_frame(&state, &conn, r#"{"request_id":"S","end":true}"#).await;
        apply_frame(&state, &conn, r#"{"request_id":"S","data":"late"}"#).await;
        apply_frame(&state, &conn, r#"{"request_id":"S","end":true}"#).await;

        assert_eq!(sub.recv().await, Some(StreamFrame::End));
        assert_eq!(sub.recv().await, None);
        assert_eq!(conn.open_streams(), 0);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_skipped() {
        let (state, _bus, _rx) = test_state(DispatchConfig::default());
        let (conn, _control) = state.workers.register(None, &ConnectionConfig::default());

        apply_frame(&state, &conn, "{broken").await;
        apply_frame(&state, &conn, r#"{"request_id":"ghost","data":"x"}"#).await;
        apply_frame(&state, &conn, r#"{"request_id":"ghost","end":true}"#).await;

        assert_eq!(conn.open_streams(), 0);
        assert!(state.correlation.streams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_client_buffer_aborts_only_that_stream() {
        let (state, _bus, _rx) = test_state(DispatchConfig::default());
        let (conn, _control) = state.workers.register(None, &ConnectionConfig::default());
        let _stuck = state.correlation.register_stream("slow", 1).unwrap();
        let mut fine = state.correlation.register_stream("fast", 4).unwrap();

        apply_frame(&state, &conn, r#"{"request_id":"slow","data":"1"}"#).await;
        apply_frame(&state, &conn, r#"{"request_id":"slow","data":"2"}"#).await;
        apply_frame(&state, &conn, r#"{"request_id":"fast","data":"ok"}"#).await;

        assert!(!state.correlation.streams().contains("slow"));
        assert_eq!(fine.recv().await, Some(StreamFrame::Chunk(Bytes::from_static(b"ok"))));
        assert_eq!(conn.open_streams(), 1);
    }
}
