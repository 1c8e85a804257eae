pub mod dispatch;
pub mod keys;
pub mod policy;
pub mod request;
pub mod upstream;

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::dispatch::dispatch;
use crate::keys::{Clock, Credential, KeyRegistry, KeyStatus};
use crate::policy::StatusPolicy;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    keys: KeyRegistry,
    upstream: UpstreamClient,
    clock: Clock,
    config: AppConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_request_bytes: usize,
    pub upstream_base_url: String,
    pub upstream_connect_timeout: Duration,
    /// Bound on one upstream attempt, connect through full body.
    pub upstream_timeout: Duration,
    pub status_policy: StatusPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 1_048_576,
            upstream_base_url: "https://openrouter.ai/api".to_string(),
            upstream_connect_timeout: Duration::from_millis(10_000),
            upstream_timeout: Duration::from_millis(30_000),
            status_policy: StatusPolicy::default(),
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, credentials: Vec<Credential>) -> Self {
        Self::with_clock(config, credentials, Clock::monotonic())
    }

    pub fn with_clock(config: AppConfig, credentials: Vec<Credential>, clock: Clock) -> Self {
        let http_client = Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .expect("failed to build reqwest client");
        let upstream = UpstreamClient::new(
            http_client,
            &config.upstream_base_url,
            config.upstream_timeout,
        );
        Self {
            keys: KeyRegistry::new(credentials),
            upstream,
            clock,
            config,
        }
    }

    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/keys", get(key_statuses))
        .route("/chat", post(chat))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub keys_total: usize,
    pub keys_ready: usize,
}

async fn readyz(State(state): State<AppState>) -> Response {
    let selection = state.keys.select(state.clock.now_ms()).await;
    let readiness = Readiness {
        ready: selection.any_ready(),
        keys_total: selection.len(),
        keys_ready: selection.ready_count(),
    };
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn key_statuses(State(state): State<AppState>) -> Json<Vec<KeyStatus>> {
    Json(state.keys.select(state.clock.now_ms()).await.statuses())
}

async fn chat(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON body"),
    };

    dispatch(&state, payload).await.into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        error: message.to_string(),
    };
    (status, Json(body)).into_response()
}
