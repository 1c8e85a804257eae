//! Failure classification.
//!
//! Every upstream outcome is mapped here to the action the dispatch loop takes and
//! to the health change applied to the credential that produced it. The dispatch
//! loop never looks at raw statuses itself.

use crate::keys::HealthDelta;
use crate::upstream::UpstreamOutcome;

pub const RATE_LIMIT_PENALTY: u32 = 2;
pub const DEFAULT_RATE_LIMIT_COOLDOWN_MS: u64 = 60_000;
pub const AUTH_PENALTY: u32 = 5;
pub const AUTH_COOLDOWN_MS: u64 = 6 * 60 * 60 * 1_000;
pub const SERVER_ERROR_PENALTY: u32 = 1;
pub const TRANSPORT_PENALTY: u32 = 1;
pub const TRANSPORT_COOLDOWN_MS: u64 = 10_000;

/// Statuses that describe a bad model identifier or payload, whichever key is used.
const REQUEST_SHAPE_STATUSES: [u16; 3] = [400, 404, 422];

/// Overrides for statuses outside the fixed table.
///
/// By default any such non-2xx status fails fast. Statuses listed in
/// `retry_statuses` are instead treated like a transient upstream error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusPolicy {
    pub retry_statuses: Vec<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailFast {
    /// 400/404/422: the model identifier or payload is invalid.
    RequestShape,
    /// Any other non-2xx the policy does not retry (e.g. 402).
    NonRecoverable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Succeed,
    RetryNextKey,
    CooldownAndRetryNextKey,
    FailFast(FailFast),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub delta: HealthDelta,
    /// Short label for logs.
    pub reason: &'static str,
}

impl StatusPolicy {
    /// Classifies `outcome` observed at `now_ms`.
    pub fn classify(&self, outcome: &UpstreamOutcome, now_ms: u64) -> Verdict {
        match outcome {
            UpstreamOutcome::Success { .. } => Verdict {
                action: Action::Succeed,
                delta: HealthDelta::Reset,
                reason: "success",
            },
            UpstreamOutcome::TransportFailure { .. } => Verdict {
                action: Action::RetryNextKey,
                delta: HealthDelta::Penalize {
                    score: TRANSPORT_PENALTY,
                    cooldown_until_ms: Some(now_ms.saturating_add(TRANSPORT_COOLDOWN_MS)),
                },
                reason: "transport_error",
            },
            UpstreamOutcome::UpstreamError {
                status,
                retry_after_secs,
                ..
            } => self.classify_status(*status, *retry_after_secs, now_ms),
        }
    }

    fn classify_status(
        &self,
        status: u16,
        retry_after_secs: Option<u64>,
        now_ms: u64,
    ) -> Verdict {
        match status {
            s if REQUEST_SHAPE_STATUSES.contains(&s) => Verdict {
                action: Action::FailFast(FailFast::RequestShape),
                delta: HealthDelta::Unchanged,
                reason: "invalid_request",
            },
            429 => {
                let cooldown_ms = retry_after_secs
                    .map(|secs| secs.saturating_mul(1_000))
                    .unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN_MS);
                Verdict {
                    action: Action::CooldownAndRetryNextKey,
                    delta: HealthDelta::Penalize {
                        score: RATE_LIMIT_PENALTY,
                        cooldown_until_ms: Some(now_ms.saturating_add(cooldown_ms)),
                    },
                    reason: "rate_limited",
                }
            }
            401 | 403 => Verdict {
                action: Action::CooldownAndRetryNextKey,
                delta: HealthDelta::Penalize {
                    score: AUTH_PENALTY,
                    cooldown_until_ms: Some(now_ms.saturating_add(AUTH_COOLDOWN_MS)),
                },
                reason: "credential_rejected",
            },
            s if s >= 500 => Verdict {
                action: Action::RetryNextKey,
                delta: HealthDelta::Penalize {
                    score: SERVER_ERROR_PENALTY,
                    cooldown_until_ms: None,
                },
                reason: "upstream_server_error",
            },
            s if self.retry_statuses.contains(&s) => Verdict {
                action: Action::RetryNextKey,
                delta: HealthDelta::Penalize {
                    score: SERVER_ERROR_PENALTY,
                    cooldown_until_ms: None,
                },
                reason: "retryable_status",
            },
            _ => Verdict {
                action: Action::FailFast(FailFast::NonRecoverable),
                delta: HealthDelta::Unchanged,
                reason: "non_recoverable_status",
            },
        }
    }
}
