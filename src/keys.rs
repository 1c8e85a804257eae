use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Environment variable prefix for credential secrets (`API_KEY_1`, `API_KEY_2`, ...).
pub const KEY_ENV_PREFIX: &str = "API_KEY_";

/// Millisecond clock used for cooldown bookkeeping.
///
/// `Monotonic` counts from process start, so a cooldown of `0` always means "ready".
/// `Manual` is pinned by the caller and only moves through [`Clock::advance`].
#[derive(Clone, Debug)]
pub enum Clock {
    Monotonic(Instant),
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn monotonic() -> Self {
        Self::Monotonic(Instant::now())
    }

    pub fn manual(start_ms: u64) -> Self {
        Self::Manual(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            Self::Monotonic(origin) => origin.elapsed().as_millis() as u64,
            Self::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Moves a manual clock forward. No-op on the monotonic clock.
    pub fn advance(&self, ms: u64) {
        if let Self::Manual(now) = self {
            now.fetch_add(ms, Ordering::SeqCst);
        }
    }
}

/// Mutable health bookkeeping for one credential.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHealth {
    pub error_score: u32,
    pub cooldown_until_ms: u64,
}

impl KeyHealth {
    pub fn is_ready(&self, now_ms: u64) -> bool {
        self.cooldown_until_ms <= now_ms
    }

    pub fn cooldown_remaining_ms(&self, now_ms: u64) -> u64 {
        self.cooldown_until_ms.saturating_sub(now_ms)
    }

    /// Applies a classifier delta. The cooldown never moves backwards except on reset.
    pub fn apply(&mut self, delta: HealthDelta) {
        match delta {
            HealthDelta::Unchanged => {}
            HealthDelta::Reset => *self = Self::default(),
            HealthDelta::Penalize {
                score,
                cooldown_until_ms,
            } => {
                self.error_score = self.error_score.saturating_add(score);
                if let Some(until) = cooldown_until_ms {
                    self.cooldown_until_ms = self.cooldown_until_ms.max(until);
                }
            }
        }
    }
}

/// Change to a credential's health decided by the failure classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthDelta {
    Unchanged,
    Reset,
    Penalize {
        score: u32,
        cooldown_until_ms: Option<u64>,
    },
}

/// One upstream key: a stable identifier, the bearer secret, and its health.
#[derive(Clone)]
pub struct Credential {
    id: String,
    secret: String,
    health: KeyHealth,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            health: KeyHealth::default(),
        }
    }

    pub fn with_health(mut self, health: KeyHealth) -> Self {
        self.health = health;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("health", &self.health)
            .finish()
    }
}

/// Collects `API_KEY_<n>` variables ordered by `n`, dropping blank values.
pub fn credentials_from_env<I>(vars: I) -> Vec<Credential>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut indexed: Vec<(u32, Credential)> = vars
        .into_iter()
        .filter_map(|(name, value)| {
            let index = name.strip_prefix(KEY_ENV_PREFIX)?.parse::<u32>().ok()?;
            let secret = value.trim();
            if secret.is_empty() {
                return None;
            }
            Some((index, Credential::new(name, secret)))
        })
        .collect();

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, credential)| credential).collect()
}

/// Diagnostic view of a credential. Never carries the secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key: String,
    pub error_score: u32,
    pub ready: bool,
    pub cooldown_remaining_ms: u64,
}

impl KeyStatus {
    fn of(credential: &Credential, now_ms: u64) -> Self {
        Self {
            key: credential.id.clone(),
            error_score: credential.health.error_score,
            ready: credential.health.is_ready(now_ms),
            cooldown_remaining_ms: credential.health.cooldown_remaining_ms(now_ms),
        }
    }
}

/// Attempt order for one request, produced by [`order_for_attempt`].
#[derive(Debug)]
pub struct Selection {
    candidates: Vec<Credential>,
    ready: usize,
    now_ms: u64,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn any_ready(&self) -> bool {
        self.ready > 0
    }

    pub fn ready_count(&self) -> usize {
        self.ready
    }

    /// Shortest remaining cooldown across every credential, in milliseconds.
    pub fn retry_after_ms(&self) -> u64 {
        self.candidates
            .iter()
            .map(|credential| credential.health.cooldown_remaining_ms(self.now_ms))
            .min()
            .unwrap_or(0)
    }

    pub fn statuses(&self) -> Vec<KeyStatus> {
        self.candidates
            .iter()
            .map(|credential| KeyStatus::of(credential, self.now_ms))
            .collect()
    }

    pub fn into_candidates(self) -> Vec<Credential> {
        self.candidates
    }
}

/// Orders credentials ready-before-cooling, then by ascending error score.
///
/// The sort is stable, so ties keep configuration order.
pub fn order_for_attempt(mut credentials: Vec<Credential>, now_ms: u64) -> Selection {
    credentials.sort_by_key(|credential| {
        (
            !credential.health.is_ready(now_ms),
            credential.health.error_score,
        )
    });
    let ready = credentials
        .iter()
        .take_while(|credential| credential.health.is_ready(now_ms))
        .count();

    Selection {
        candidates: credentials,
        ready,
        now_ms,
    }
}

/// Process-wide credential set.
///
/// Cloning shares the same underlying state. Each mutation takes the write lock
/// only for the duration of a single credential update, so score and cooldown are
/// always read and written together.
#[derive(Clone, Default)]
pub struct KeyRegistry {
    credentials: Arc<RwLock<Vec<Credential>>>,
}

impl KeyRegistry {
    pub fn new(credentials: Vec<Credential>) -> Self {
        let credentials = credentials
            .into_iter()
            .filter(|credential| !credential.secret.trim().is_empty())
            .collect();
        Self {
            credentials: Arc::new(RwLock::new(credentials)),
        }
    }

    pub async fn select(&self, now_ms: u64) -> Selection {
        order_for_attempt(self.credentials.read().await.clone(), now_ms)
    }

    pub async fn health(&self, id: &str) -> Option<KeyHealth> {
        self.credentials
            .read()
            .await
            .iter()
            .find(|credential| credential.id == id)
            .map(|credential| credential.health)
    }

    pub async fn is_ready(&self, id: &str, now_ms: u64) -> bool {
        self.health(id)
            .await
            .is_some_and(|health| health.is_ready(now_ms))
    }

    /// Applies `delta` to the credential named `id`, returning its new health.
    pub async fn apply(&self, id: &str, delta: HealthDelta) -> Option<KeyHealth> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials.iter_mut().find(|credential| credential.id == id)?;
        credential.health.apply(delta);
        Some(credential.health)
    }
}
