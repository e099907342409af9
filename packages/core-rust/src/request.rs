//! Client request body accepted by the completions endpoint.

use serde::Deserialize;
use serde_json::value::RawValue;

/// Fields the gateway reads from the client body. Everything else is opaque
/// and travels to the worker untouched inside `Task::data`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    /// Work target; selects the bus topic.
    pub model: String,
    /// Requests an event-stream response when `Some(true)`.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ClientRequest {
    /// Returns `true` when the client asked for a streamed response.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Reasons a client body is rejected before anything is published.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed JSON body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("request body is not valid UTF-8")]
    NotUtf8,
    #[error("request body has an empty model")]
    EmptyModel,
}

/// A validated client request together with its raw body.
#[derive(Debug)]
pub struct ParsedRequest {
    pub request: ClientRequest,
    /// The body exactly as received, reused as `Task::data`.
    pub raw: Box<RawValue>,
}

/// Parses and validates a raw completions body.
///
/// # Errors
///
/// Returns [`RequestError`] when the body is not UTF-8, is not JSON, lacks a
/// string `model`, or names an empty model.
pub fn parse_client_request(body: &[u8]) -> Result<ParsedRequest, RequestError> {
    let text = std::str::from_utf8(body).map_err(|_| RequestError::NotUtf8)?;
    let request: ClientRequest = serde_json::from_str(text)?;
    if request.model.is_empty() {
        return Err(RequestError::EmptyModel);
    }
    let raw = RawValue::from_string(text.trim().to_string())?;
    Ok(ParsedRequest { request, raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_and_stream_flag() {
        let parsed = parse_client_request(br#"{"model":"alpha","stream":true}"#).unwrap();
        assert_eq!(parsed.request.model, "alpha");
        assert!(parsed.request.is_stream());
    }

    #[test]
    fn stream_defaults_to_false() {
        let parsed = parse_client_request(br#"{"model":"alpha"}"#).unwrap();
        assert!(!parsed.request.is_stream());

        let parsed = parse_client_request(br#"{"model":"alpha","stream":null}"#).unwrap();
        assert!(!parsed.request.is_stream());
    }

    #[test]
    fn raw_body_keeps_unknown_fields() {
        let body = br#"{"model":"alpha","messages":[{"role":"user","content":"hi"}]}"#;
        let parsed = parse_client_request(body).unwrap();
        assert_eq!(parsed.raw.get().as_bytes(), body);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_client_request(b"{not json").unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }

    #[test]
    fn rejects_missing_or_empty_model() {
        assert!(matches!(
            parse_client_request(br#"{"stream":false}"#).unwrap_err(),
            RequestError::Malformed(_)
        ));
        assert!(matches!(
            parse_client_request(br#"{"model":""}"#).unwrap_err(),
            RequestError::EmptyModel
        ));
    }

    #[test]
    fn rejects_non_utf8() {
        assert!(matches!(
            parse_client_request(&[0xff, 0xfe]).unwrap_err(),
            RequestError::NotUtf8
        ));
    }
}
