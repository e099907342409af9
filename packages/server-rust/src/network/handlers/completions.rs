//! `POST /api/v1/chat/completions`: publish a task, then wait or stream.
//!
//! The request id is registered before the task is published so a fast
//! worker can never answer an id the gateway does not know yet. Every exit
//! path drops the registration guard, which removes the entry.

use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use taskgate_core::{parse_client_request, topic_for_model, ErrorKind, Task, TaskMetadata};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::correlation::WaitError;
use crate::network::sse::{StreamLimits, StreamPump};
use crate::network::DispatchKind;
use crate::observability;

pub async fn completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Completions body could not be read");
            let err = ApiError::from_body_rejection(&rejection);
            let outcome = if err.0 == ErrorKind::PayloadTooLarge {
                "too_large"
            } else {
                "bad_request"
            };
            observability::completion_finished(DispatchKind::Single, outcome);
            return err.into_response();
        }
    };
    let parsed = match parse_client_request(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "Rejected completions body");
            observability::completion_finished(requested_kind(&body), "bad_request");
            return ApiError(ErrorKind::InvalidRequest).into_response();
        }
    };

    let stream = parsed.request.is_stream();
    let request_id = Uuid::new_v4().to_string();
    let topic = topic_for_model(&parsed.request.model);
    let endpoint = if stream {
        state.endpoints.stream.clone()
    } else {
        state.endpoints.result.clone()
    };

    let task = Task {
        request_id: request_id.clone(),
        stream,
        data: parsed.raw,
        endpoint,
        metadata: metadata_from(&headers),
    };
    let payload = match task.to_bytes() {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            error!(request_id, error = %err, "Failed to encode task");
            return ApiError(ErrorKind::Internal).into_response();
        }
    };

    if stream {
        dispatch_stream(state, request_id, topic, payload).await
    } else {
        dispatch_single(state, request_id, topic, payload).await
    }
}

/// Best-effort read of `stream` from a body that failed validation.
fn requested_kind(body: &[u8]) -> DispatchKind {
    let stream = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);
    if stream {
        DispatchKind::Stream
    } else {
        DispatchKind::Single
    }
}

fn metadata_from(headers: &HeaderMap) -> TaskMetadata {
    TaskMetadata::from_headers(headers.iter().map(|(name, value)| {
        (
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
    }))
}

async fn dispatch_single(
    state: AppState,
    request_id: String,
    topic: String,
    payload: Bytes,
) -> Response {
    let _in_flight = state.shutdown.in_flight_guard(DispatchKind::Single);

    let mut pending = match state.correlation.register_result(&request_id) {
        Ok(pending) => pending,
        Err(err) => {
            error!(request_id, error = %err, "Failed to register request");
            return ApiError(ErrorKind::Internal).into_response();
        }
    };

    if let Err(err) = state.producers.publish(&topic, payload).await {
        error!(request_id, topic, error = %err, "Failed to publish task");
        observability::publish_failed();
        observability::completion_finished(DispatchKind::Single, "publish_failed");
        return ApiError(ErrorKind::Internal).into_response();
    }
    debug!(request_id, topic, "Task published, awaiting result");

    let started = Instant::now();
    match pending.wait(state.dispatch.result_timeout).await {
        Ok(result) => {
            observability::result_waited(started.elapsed());
            observability::completion_finished(DispatchKind::Single, "ok");
            debug!(request_id, bytes = result.len(), "Result delivered");
            (
                StatusCode::OK,
                [(CONTENT_TYPE, "application/json")],
                result,
            )
                .into_response()
        }
        Err(WaitError::TimedOut) => {
            warn!(request_id, topic, "Timed out waiting for worker result");
            observability::completion_finished(DispatchKind::Single, "timeout");
            ApiError(ErrorKind::RequestTimeout).into_response()
        }
        Err(WaitError::Closed) => {
            error!(request_id, "Result channel closed without a value");
            observability::completion_finished(DispatchKind::Single, "closed");
            ApiError(ErrorKind::Internal).into_response()
        }
    }
}

async fn dispatch_stream(
    state: AppState,
    request_id: String,
    topic: String,
    payload: Bytes,
) -> Response {
    let in_flight = state.shutdown.in_flight_guard(DispatchKind::Stream);

    let subscription = match state
        .correlation
        .register_stream(&request_id, state.dispatch.stream_buffer)
    {
        Ok(subscription) => subscription,
        Err(err) => {
            error!(request_id, error = %err, "Failed to register stream");
            return ApiError(ErrorKind::Internal).into_response();
        }
    };

    if let Err(err) = state.producers.publish(&topic, payload).await {
        error!(request_id, topic, error = %err, "Failed to publish streaming task");
        observability::publish_failed();
        observability::completion_finished(DispatchKind::Stream, "publish_failed");
        return ApiError(ErrorKind::Internal).into_response();
    }
    debug!(request_id, topic, "Streaming task published");
    observability::completion_finished(DispatchKind::Stream, "streaming");

    let pump = StreamPump::new(
        subscription,
        StreamLimits::from(state.dispatch.as_ref()),
        state.shutdown.shutdown_receiver(),
        Some(in_flight),
    );

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(pump.into_stream()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::http::HeaderValue;

    use super::*;
    use crate::bus::PublishedMessage;
    use crate::network::handlers::test_support::test_state;
    use crate::network::DispatchConfig;

    fn decode_task(msg: &PublishedMessage) -> Task {
        serde_json::from_slice(&msg.payload).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn single_round_trip() {
        let (state, _bus, mut rx) = test_state(DispatchConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));

        let call = tokio::spawn(completions_handler(
            State(state.clone()),
            headers,
            Ok(Bytes::from_static(br#"{"model":"alpha","messages":[]}"#)),
        ));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "model-alpha");
        let task = decode_task(&msg);
        assert!(!task.stream);
        assert_eq!(task.endpoint, "http://gw.test:8080/res");
        assert_eq!(task.data.get(), r#"{"model":"alpha","messages":[]}"#);
        assert_eq!(task.metadata.headers["x-tenant"], vec!["acme".to_string()]);

        state
            .correlation
            .results()
            .deliver(&task.request_id, Bytes::from_static(br#"{"ok":true}"#))
            .unwrap();

        let response = call.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_json(response).await, serde_json::json!({"ok": true}));
        assert!(state.correlation.results().is_empty());
        assert_eq!(state.shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_400_and_nothing_published() {
        let (state, _bus, mut rx) = test_state(DispatchConfig::default());

        let bodies: [&[u8]; 3] = [b"{not json", br#"{"stream":true}"#, br#"{"model":""}"#];
        for body in bodies {
            let response = completions_handler(
                State(state.clone()),
                HeaderMap::new(),
                Ok(Bytes::copy_from_slice(body)),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json = body_json(response).await;
            assert_eq!(json["error"]["type"], "invalid_request_error");
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejected_bodies_are_labelled_by_requested_kind() {
        assert_eq!(requested_kind(br#"{"stream":true}"#), DispatchKind::Stream);
        assert_eq!(requested_kind(br#"{"model":"","stream":true}"#), DispatchKind::Stream);
        assert_eq!(requested_kind(br#"{"model":""}"#), DispatchKind::Single);
        assert_eq!(requested_kind(br#"{"stream":"yes"}"#), DispatchKind::Single);
        assert_eq!(requested_kind(b"{not json"), DispatchKind::Single);
    }

    #[tokio::test]
    async fn publish_failure_is_500_and_unregisters() {
        let (state, bus, _rx) = test_state(DispatchConfig::default());
        bus.fail_topic("model-down");

        let bodies: [&[u8]; 2] = [br#"{"model":"down"}"#, br#"{"model":"down","stream":true}"#];
        for body in bodies {
            let response = completions_handler(
                State(state.clone()),
                HeaderMap::new(),
                Ok(Bytes::copy_from_slice(body)),
            )
            .await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let json = body_json(response).await;
            assert_eq!(json["error"]["message"], "Internal server error");
        }
        assert!(state.correlation.results().is_empty());
        assert!(state.correlation.streams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_408_and_late_result_is_not_found() {
        let (state, _bus, mut rx) = test_state(DispatchConfig {
            result_timeout: Duration::from_millis(200),
            ..DispatchConfig::default()
        });

        let response = completions_handler(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Bytes::from_static(br#"{"model":"slow"}"#)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body_json(response).await["error"]["type"], "request_timeout_error");

        let task = decode_task(&rx.recv().await.unwrap());
        assert!(state.correlation.results().is_empty());
        assert_eq!(
            state
                .correlation
                .results()
                .deliver(&task.request_id, Bytes::from_static(b"late")),
            Err(crate::correlation::DeliveryError::NotFound)
        );
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (state, _bus, mut rx) = test_state(DispatchConfig::default());

        let response = completions_handler(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Bytes::from_static(br#"{"model":"alpha","stream":true}"#)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");

        let task = decode_task(&rx.recv().await.unwrap());
        assert!(task.stream);
        assert_eq!(task.endpoint, "ws://gw.test:8080/res/ws");

        let streams = state.correlation.streams();
        let timeout = Duration::from_secs(1);
        streams
            .send_chunk(&task.request_id, Bytes::from_static(b"chunk1"), timeout)
            .await
            .unwrap();
        streams.end(&task.request_id, timeout).await.unwrap();

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data: chunk1\n\ndata: [DONE]\n\n");
        assert!(streams.is_empty());
        assert_eq!(state.shutdown.in_flight_count(), 0);
    }
}
