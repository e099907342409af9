//! `POST /res`: single-shot worker callback.

use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use taskgate_core::{ErrorKind, TaskResult};
use tracing::{debug, warn};

use super::{ApiError, AppState};
use crate::correlation::DeliveryError;
use crate::observability;

/// Hands a worker's result to the waiting client request.
///
/// Never blocks on the client: delivery either claims the waiting slot or
/// reports 404.
pub async fn result_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Result body could not be read");
            observability::callback_received("http", "bad_request");
            return ApiError::from_body_rejection(&rejection).into_response();
        }
    };
    let result: TaskResult = match serde_json::from_slice(&body) {
        Ok(result) => result,
        Err(err) => {
            debug!(error = %err, "Rejected result body");
            observability::callback_received("http", "bad_request");
            return ApiError(ErrorKind::InvalidRequest).into_response();
        }
    };

    let request_id = result.request_id.as_str();
    match state
        .correlation
        .results()
        .deliver(request_id, Bytes::from(result.payload()))
    {
        Ok(()) => {
            debug!(request_id, "Result accepted");
            observability::callback_received("http", "ok");
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Err(err) => {
            warn!(request_id, reason = %err, "Result for unknown or expired request id");
            observability::callback_received("http", delivery_label(err));
            ApiError(ErrorKind::RequestIdNotFound).into_response()
        }
    }
}

pub(crate) fn delivery_label(err: DeliveryError) -> &'static str {
    match err {
        DeliveryError::NotFound => "not_found",
        DeliveryError::ConsumerGone => "consumer_gone",
        DeliveryError::SlowConsumer => "slow_consumer",
    }
}
