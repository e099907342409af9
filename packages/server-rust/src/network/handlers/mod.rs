//! HTTP and WebSocket handlers plus the state they share.

pub mod completions;
pub mod health;
pub mod result_stream;
pub mod results;

pub use completions::completions_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use result_stream::result_stream_handler;
pub use results::result_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::BytesRejection;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use taskgate_core::{ErrorBody, ErrorKind};

use super::{DispatchConfig, NetworkConfig, ShutdownController, WorkerConnectionRegistry};
use crate::bus::ProducerCache;
use crate::correlation::CorrelationRegistry;

/// Callback addresses embedded in published tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEndpoints {
    /// Single-shot result URL, e.g. `http://gw-1:8080/res`.
    pub result: String,
    /// Streaming result URL, e.g. `ws://gw-1:8080/res/ws`.
    pub stream: String,
}

impl CallbackEndpoints {
    /// Builds both URLs for `host:port`, using the TLS schemes when `tls`.
    #[must_use]
    pub fn new(host: &str, port: u16, tls: bool) -> Self {
        let (http, ws) = if tls { ("https", "wss") } else { ("http", "ws") };
        Self {
            result: format!("{http}://{host}:{port}/res"),
            stream: format!("{ws}://{host}:{port}/res/ws"),
        }
    }
}

/// Shared state passed to all handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub correlation: Arc<CorrelationRegistry>,
    pub producers: Arc<ProducerCache>,
    pub workers: Arc<WorkerConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub network: Arc<NetworkConfig>,
    pub dispatch: Arc<DispatchConfig>,
    pub endpoints: Arc<CallbackEndpoints>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

/// Error response with the standard body for its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError(pub ErrorKind);

impl ApiError {
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self.0 {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::RequestIdNotFound => StatusCode::NOT_FOUND,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Maps a failed body read: oversized bodies are 413, anything else 400.
    #[must_use]
    pub fn from_body_rejection(rejection: &BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self(ErrorKind::PayloadTooLarge)
        } else {
            Self(ErrorKind::InvalidRequest)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0.body())).into_response()
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self(kind)
    }
}

/// Gives bodiless error responses from layers and the router (timeouts,
/// unknown routes, wrong methods) the standard error body.
pub async fn ensure_error_body(response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error())
        || response.headers().contains_key(CONTENT_TYPE)
    {
        return response;
    }
    if status == StatusCode::REQUEST_TIMEOUT {
        return ApiError(ErrorKind::RequestTimeout).into_response();
    }
    let error_type = if status.is_server_error() {
        ErrorKind::Internal.type_name()
    } else {
        ErrorKind::InvalidRequest.type_name()
    };
    let message = status.canonical_reason().unwrap_or("Request failed");
    (status, Json(ErrorBody::new(message, error_type))).into_response()
}
