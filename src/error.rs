//! Unified, wire-typed HTTP error for the proxy.
//!
//! Unlike a single opaque wrapper, [`ProxyError`] carries an [`ErrorKind`]
//! discriminant so every error surfaces both an HTTP status code and a
//! stable `error.type` string clients can match on. Internal helpers that
//! never reach the client (config parsing, file I/O) still return
//! `anyhow::Result` and are folded into [`ErrorKind::Internal`] at the
//! boundary via the blanket [`From`] impl, mirroring the teacher's
//! `AppError(anyhow::Error)` pattern.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    RequestTooLarge,
    DedupOriginFailed,
    ProviderError,
    UpstreamTimeout,
    UpstreamNetwork,
    Exhausted,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DedupOriginFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProviderError | Self::UpstreamTimeout | Self::UpstreamNetwork => {
                StatusCode::BAD_GATEWAY
            }
            Self::Exhausted => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn wire_type(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::RequestTooLarge => "request_too_large",
            Self::DedupOriginFailed => "dedup_origin_failed",
            Self::ProviderError => "provider_error",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamNetwork => "upstream_network",
            Self::Exhausted => "exhausted",
            Self::Internal => "internal",
        }
    }
}

/// A wire-facing proxy error: HTTP status + stable `type` string + message.
#[derive(Debug)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn request_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RequestTooLarge, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Render this error as the JSON body used both for HTTP responses and
    /// for synthesizing the dedup-origin-failure payload given to waiters.
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "error": { "message": self.message, "type": self.kind.wire_type() } })
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.wire_type(), self.message)
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::Internal {
            tracing::error!(error = %self.message, "internal error");
        } else {
            tracing::warn!(kind = self.kind.wire_type(), error = %self.message, "request error");
        }
        (self.kind.status(), Json(self.to_json())).into_response()
    }
}

/// Any unexpected internal failure (config, I/O, invariant violation)
/// collapses to [`ErrorKind::Internal`], same as the teacher's blanket
/// `From<anyhow::Error>` impl for `AppError`.
impl From<anyhow::Error> for ProxyError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_expected_status() {
        assert_eq!(ErrorKind::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::RequestTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ErrorKind::DedupOriginFailed.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorKind::Exhausted.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn to_json_has_stable_shape() {
        let err = ProxyError::bad_request("missing messages");
        let v = err.to_json();
        assert_eq!(v["error"]["type"], "bad_request");
        assert_eq!(v["error"]["message"], "missing messages");
    }
}
