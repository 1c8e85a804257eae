use std::time::Duration;

use axum::body::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::request::ChatRequest;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Upstream response body, parsed as JSON when possible.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpstreamBody {
    Json(Value),
    Text(String),
}

impl UpstreamBody {
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Best-effort human-readable message: `error.message`, `message`, or the raw text.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Json(value) => value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .or_else(|| value.get("error").filter(|error| error.is_string()))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            Self::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Self::Text(_) => None,
        }
    }
}

/// Result of one bounded upstream call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    Success {
        status: u16,
        body: Bytes,
    },
    UpstreamError {
        status: u16,
        body: UpstreamBody,
        retry_after_secs: Option<u64>,
    },
    TransportFailure {
        message: String,
    },
}

#[derive(Serialize)]
struct UpstreamPayload<'a> {
    model: &'a str,
    messages: &'a [Value],
    temperature: f64,
    stream: bool,
}

#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: Client,
    url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(http: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            url: format!(
                "{}{CHAT_COMPLETIONS_PATH}",
                base_url.trim_end_matches('/')
            ),
            timeout,
        }
    }

    /// Issues one call with `secret`, abandoning it once the timeout elapses.
    pub async fn send(&self, secret: &str, request: &ChatRequest) -> UpstreamOutcome {
        match tokio::time::timeout(self.timeout, self.exchange(secret, request)).await {
            Err(_) => UpstreamOutcome::TransportFailure {
                message: format!(
                    "upstream timed out after {} ms",
                    self.timeout.as_millis()
                ),
            },
            Ok(Err(err)) => UpstreamOutcome::TransportFailure {
                message: format!("upstream request failed: {}", err.without_url()),
            },
            Ok(Ok(outcome)) => outcome,
        }
    }

    async fn exchange(
        &self,
        secret: &str,
        request: &ChatRequest,
    ) -> Result<UpstreamOutcome, reqwest::Error> {
        let payload = UpstreamPayload {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            stream: false,
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(secret)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let retry_after_secs = parse_retry_after(response.headers());
        let body = response.bytes().await?;

        if status.is_success() {
            return Ok(UpstreamOutcome::Success {
                status: status.as_u16(),
                body,
            });
        }

        Ok(UpstreamOutcome::UpstreamError {
            status: status.as_u16(),
            body: UpstreamBody::parse(&body),
            retry_after_secs,
        })
    }
}

/// Reads `Retry-After` as delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.ceil() as u64)
}

impl UpstreamOutcome {
    /// Diagnostic JSON for the caller; never contains the credential secret.
    pub fn details(&self) -> Value {
        match self {
            Self::Success { status, .. } => json!({ "status": status }),
            Self::UpstreamError { status, body, .. } => json!({
                "status": status,
                "body": body,
            }),
            Self::TransportFailure { message } => json!({ "message": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn upstream_body_falls_back_to_text() {
        let body = UpstreamBody::parse(b"<html>bad gateway</html>");
        assert_eq!(body, UpstreamBody::Text("<html>bad gateway</html>".to_string()));
        assert_eq!(body.message().as_deref(), Some("<html>bad gateway</html>"));
    }

    #[test]
    fn upstream_body_extracts_openai_style_message() {
        let body = UpstreamBody::parse(
            br#"{"error":{"message":"model not found","code":404}}"#,
        );
        assert_eq!(body.message().as_deref(), Some("model not found"));

        let body = UpstreamBody::parse(br#"{"error":"quota"}"#);
        assert_eq!(body.message().as_deref(), Some("quota"));
    }

    #[test]
    fn retry_after_accepts_integer_and_fractional_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 5 "));
        assert_eq!(parse_retry_after(&headers), Some(5));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.2"));
        assert_eq!(parse_retry_after(&headers), Some(2));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn client_appends_chat_completions_path() {
        let client = UpstreamClient::new(
            Client::new(),
            "https://openrouter.ai/api/",
            Duration::from_secs(30),
        );
        assert_eq!(client.url, "https://openrouter.ai/api/v1/chat/completions");
    }
}
