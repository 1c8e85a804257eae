use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::keys::KeyStatus;
use crate::policy::{Action, FailFast};
use crate::request::{ChatRequest, InvalidRequest};
use crate::upstream::{UpstreamBody, UpstreamOutcome};
use crate::{error_response, AppState};

const REQUEST_SHAPE_HINT: &str =
    "check that the model identifier exists upstream and that messages are well-formed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    UpstreamError,
    TransportError,
    Skipped,
}

/// One entry in the caller-visible attempt trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub key: String,
    pub outcome: AttemptKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AttemptRecord {
    fn skipped(key: &str) -> Self {
        Self {
            key: key.to_string(),
            outcome: AttemptKind::Skipped,
            status: None,
            message: Some("key on cooldown; not tried".to_string()),
        }
    }

    fn from_outcome(key: &str, outcome: &UpstreamOutcome) -> Self {
        let (kind, status, message) = match outcome {
            UpstreamOutcome::Success { status, .. } => {
                (AttemptKind::UpstreamError, Some(*status), None)
            }
            UpstreamOutcome::UpstreamError { status, body, .. } => {
                (AttemptKind::UpstreamError, Some(*status), body.message())
            }
            UpstreamOutcome::TransportFailure { message } => {
                (AttemptKind::TransportError, None, Some(message.clone()))
            }
        };
        Self {
            key: key.to_string(),
            outcome: kind,
            status,
            message,
        }
    }
}

/// Terminal state of one dispatched request.
#[derive(Debug)]
pub enum DispatchOutcome {
    InvalidInput(InvalidRequest),
    NoCredentials,
    RateLimited {
        retry_after_ms: u64,
        keys: Vec<KeyStatus>,
    },
    Succeeded {
        status: u16,
        body: Bytes,
    },
    FailedFast {
        kind: FailFast,
        status: u16,
        details: UpstreamBody,
        attempts: Vec<AttemptRecord>,
    },
    Exhausted {
        last_error: Option<Value>,
        attempts: Vec<AttemptRecord>,
    },
}

/// Runs one request through selection, upstream calls, and classification until a
/// terminal state is reached.
pub async fn dispatch(state: &AppState, payload: Value) -> DispatchOutcome {
    let request = match ChatRequest::try_from(payload) {
        Ok(request) => request,
        Err(err) => return DispatchOutcome::InvalidInput(err),
    };

    let selection = state.keys.select(state.clock.now_ms()).await;
    if selection.is_empty() {
        tracing::error!("no API keys configured");
        return DispatchOutcome::NoCredentials;
    }
    if !selection.any_ready() {
        let retry_after_ms = selection.retry_after_ms();
        tracing::warn!(
            keys_total = selection.len(),
            retry_after_ms,
            "every key is cooling down; rejecting without upstream call"
        );
        return DispatchOutcome::RateLimited {
            retry_after_ms,
            keys: selection.statuses(),
        };
    }

    let keys_total = selection.len();
    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut last_error: Option<Value> = None;

    for (idx, credential) in selection.into_candidates().into_iter().enumerate() {
        let key = credential.id();
        if !state.keys.is_ready(key, state.clock.now_ms()).await {
            tracing::debug!(key, attempt_idx = idx, "skipping key on cooldown");
            attempts.push(AttemptRecord::skipped(key));
            continue;
        }

        let outcome = state.upstream.send(credential.secret(), &request).await;
        let verdict = state
            .config
            .status_policy
            .classify(&outcome, state.clock.now_ms());
        state.keys.apply(key, verdict.delta).await;

        match (verdict.action, outcome) {
            (Action::Succeed, UpstreamOutcome::Success { status, body }) => {
                tracing::info!(
                    key,
                    attempt_idx = idx,
                    keys_total,
                    upstream_status = status,
                    model = %request.model,
                    "request served"
                );
                return DispatchOutcome::Succeeded {
                    status,
                    body,
                };
            }
            (Action::FailFast(kind), outcome) => {
                let record = AttemptRecord::from_outcome(key, &outcome);
                tracing::warn!(
                    key,
                    attempt_idx = idx,
                    keys_total,
                    upstream_status = ?record.status,
                    reason = verdict.reason,
                    "non-retryable upstream failure"
                );
                attempts.push(record);
                let (status, details) = match outcome {
                    UpstreamOutcome::UpstreamError { status, body, .. } => (status, body),
                    other => (
                        StatusCode::BAD_GATEWAY.as_u16(),
                        UpstreamBody::Json(other.details()),
                    ),
                };
                return DispatchOutcome::FailedFast {
                    kind,
                    status,
                    details,
                    attempts,
                };
            }
            (_, outcome) => {
                let record = AttemptRecord::from_outcome(key, &outcome);
                tracing::warn!(
                    key,
                    attempt_idx = idx,
                    keys_total,
                    upstream_status = ?record.status,
                    reason = verdict.reason,
                    "retryable upstream failure; trying next key"
                );
                let mut details = outcome.details();
                if let Some(map) = details.as_object_mut() {
                    map.insert("key".to_string(), json!(key));
                }
                last_error = Some(details);
                attempts.push(record);
            }
        }
    }

    tracing::warn!(keys_total, attempts = attempts.len(), "all keys failed");
    DispatchOutcome::Exhausted {
        last_error,
        attempts,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub error: String,
    pub retry_after_ms: u64,
    pub keys: Vec<KeyStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailureBody {
    pub error: String,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<AttemptRecord>>,
}

impl IntoResponse for DispatchOutcome {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidInput(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
            Self::NoCredentials => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "no API keys configured",
            ),
            Self::RateLimited {
                retry_after_ms,
                keys,
            } => {
                let body = RateLimitedBody {
                    error: "all API keys are cooling down; retry later".to_string(),
                    retry_after_ms,
                    keys,
                };
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let retry_after_secs = retry_after_ms.div_ceil(1_000).max(1);
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    resp.headers_mut().insert(RETRY_AFTER, value);
                }
                resp
            }
            Self::Succeeded { status, body } => {
                let mut resp = Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                resp
            }
            Self::FailedFast {
                kind,
                status,
                details,
                attempts,
            } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let body = match kind {
                    FailFast::RequestShape => FailureBody {
                        error: format!(
                            "upstream rejected the request ({}); not retrying with other keys",
                            status.as_u16()
                        ),
                        details: json!(details),
                        hint: Some(REQUEST_SHAPE_HINT.to_string()),
                        attempts: None,
                    },
                    FailFast::NonRecoverable => FailureBody {
                        error: format!("non-recoverable upstream error ({})", status.as_u16()),
                        details: json!(details),
                        hint: None,
                        attempts: Some(attempts),
                    },
                };
                (status, Json(body)).into_response()
            }
            Self::Exhausted {
                last_error,
                attempts,
            } => {
                let status = if last_error.is_some() {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                let body = FailureBody {
                    error: "all API keys failed or are rate limited".to_string(),
                    details: last_error.unwrap_or(Value::Null),
                    hint: None,
                    attempts: Some(attempts),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(outcome: DispatchOutcome) -> (StatusCode, FailureBody) {
        let resp = outcome.into_response();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn exhausted_with_every_key_skipped_is_500() {
        let (status, body) = render(DispatchOutcome::Exhausted {
            last_error: None,
            attempts: vec![AttemptRecord::skipped("API_KEY_1")],
        })
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.details, Value::Null);
        let attempts = body.attempts.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptKind::Skipped);
        assert_eq!(attempts[0].status, None);
    }

    #[tokio::test]
    async fn exhausted_after_upstream_errors_is_502() {
        let outcome = UpstreamOutcome::UpstreamError {
            status: 503,
            body: UpstreamBody::Text("busy".to_string()),
            retry_after_secs: None,
        };
        let (status, body) = render(DispatchOutcome::Exhausted {
            last_error: Some(outcome.details()),
            attempts: vec![AttemptRecord::from_outcome("API_KEY_1", &outcome)],
        })
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.details["status"], 503);
        assert_eq!(body.attempts.unwrap()[0].message.as_deref(), Some("busy"));
    }
}
