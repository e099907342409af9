//! API error bodies shared by every error path.
//!
//! Shape: `{"error": {"message": .., "type": .., "param": null, "code": null}}`.
//! Messages are fixed per kind so no internal detail leaks to callers.

use serde::Serialize;

/// Closed set of errors the gateway reports over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The body could not be parsed or validated.
    InvalidRequest,
    /// Producer acquisition or publishing failed.
    Internal,
    /// No result arrived before the deadline.
    RequestTimeout,
    /// A worker reported a result for an unknown or expired request id.
    RequestIdNotFound,
    /// The body exceeded the configured size limit.
    PayloadTooLarge,
}

impl ErrorKind {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidRequest => "We could not parse the JSON body of your request.",
            Self::Internal => "Internal server error",
            Self::RequestTimeout => "Request timeout",
            Self::RequestIdNotFound => "Request ID not found",
            Self::PayloadTooLarge => "Request body too large",
        }
    }

    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Internal => "internal_server_error",
            Self::RequestTimeout => "request_timeout_error",
            Self::RequestIdNotFound => "not_found_error",
            Self::PayloadTooLarge => "request_too_large_error",
        }
    }

    /// Builds the serializable body for this kind.
    #[must_use]
    pub fn body(self) -> ErrorBody {
        ErrorBody::new(self.message(), self.type_name())
    }
}

/// Outer error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl ErrorBody {
    /// Builds a body with an arbitrary message, used for stream-level errors.
    #[must_use]
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
                param: None,
                code: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_serializes_with_null_param_and_code() {
        let json = serde_json::to_value(ErrorKind::InvalidRequest.body()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": {
                    "message": "We could not parse the JSON body of your request.",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": null,
                }
            })
        );
    }

    #[test]
    fn each_kind_has_distinct_type() {
        let kinds = [
            ErrorKind::InvalidRequest,
            ErrorKind::Internal,
            ErrorKind::RequestTimeout,
            ErrorKind::RequestIdNotFound,
            ErrorKind::PayloadTooLarge,
        ];
        let mut types: Vec<_> = kinds.iter().map(|k| k.type_name()).collect();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), kinds.len());
    }

    #[test]
    fn timeout_body() {
        let body = ErrorKind::RequestTimeout.body();
        assert_eq!(body.error.message, "Request timeout");
        assert_eq!(body.error.error_type, "request_timeout_error");
    }
}
