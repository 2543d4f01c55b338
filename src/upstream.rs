//! Upstream inference client.
//!
//! A single OpenAI-compatible endpoint every routed model is dispatched
//! against, grounded on `backends::openai::OpenAIAdapter`'s buffered/
//! streaming client split: `client` carries the configured request
//! timeout, `stream_client` has none (bytes arrive incrementally; only the
//! TCP connect timeout applies).

use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use reqwest::{header, Client};
use serde_json::Value;

use crate::config::UpstreamConfig;

pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// A buffered (non-streaming) upstream response.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, timeout_secs: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = config.api_key() {
            let value = format!("Bearer {key}");
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("upstream API key contains invalid header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build upstream reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming upstream reqwest client");

        Self { client, stream_client, base_url: config.base_url.clone() }
    }

    /// `POST /v1/chat/completions` with the model substituted and a payment
    /// attestation attached, buffering the full response.
    pub async fn chat_completions(
        &self,
        mut body: Value,
        model: &str,
        payment: &str,
    ) -> anyhow::Result<UpstreamResponse> {
        body["model"] = Value::String(model.to_string());
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-Payment", payment)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.context("reading upstream response body")?;

        Ok(UpstreamResponse { status, headers, body })
    }

    /// `POST /v1/chat/completions` in streaming mode; bytes are forwarded
    /// verbatim as they arrive.
    pub async fn chat_completions_stream(
        &self,
        mut body: Value,
        model: &str,
        payment: &str,
    ) -> anyhow::Result<(u16, Vec<(String, String)>, SseStream)> {
        body["model"] = Value::String(model.to_string());
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .header("X-Payment", payment)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        Ok((status, headers, Box::pin(stream)))
    }
}

const RETRYABLE_ERROR_TYPES: &[&str] = &["provider_error", "insufficient_funds", "billing_error"];

/// Whether an upstream attempt should move on to the next fallback model:
/// status ∈ {402, 413, 429, 5xx} or a JSON `error.type` in the retryable set.
pub fn is_retryable(status: u16, body: &[u8]) -> bool {
    if matches!(status, 402 | 413 | 429) || (500..600).contains(&status) {
        return true;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else { return false };
    value
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .map(|t| RETRYABLE_ERROR_TYPES.contains(&t))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_on_billing_status_codes() {
        assert!(is_retryable(402, b"{}"));
        assert!(is_retryable(413, b"{}"));
        assert!(is_retryable(429, b"{}"));
        assert!(is_retryable(500, b"{}"));
        assert!(is_retryable(503, b"{}"));
    }

    #[test]
    fn does_not_retry_on_client_errors() {
        assert!(!is_retryable(400, b"{}"));
        assert!(!is_retryable(404, b"{}"));
    }

    #[test]
    fn retries_on_provider_classified_json_error() {
        let body = br#"{"error":{"type":"insufficient_funds","message":"no balance"}}"#;
        assert!(is_retryable(200, body));
    }

    #[test]
    fn does_not_retry_on_unrelated_json_error_type() {
        let body = br#"{"error":{"type":"bad_request","message":"oops"}}"#;
        assert!(!is_retryable(200, body));
    }

    #[test]
    fn malformed_body_is_not_retryable_by_itself() {
        assert!(!is_retryable(200, b"not json"));
    }
}
