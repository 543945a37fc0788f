use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::observability::workflow_metrics;
use crate::workflow::types::Idempotent;

const KEY_PREFIX: &str = "idempotency:";
pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(300);

/// A response replayed to a client that retries with the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status_code: u16,
    pub payload: serde_json::Value,
    #[serde(skip, default = "Instant::now")]
    inserted_at: Instant,
    #[serde(skip)]
    ttl: Duration,
}

impl CachedResponse {
    pub fn new(status_code: u16, payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            status_code,
            payload,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

struct PerEntryTtl;

impl Expiry<String, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedResponse,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Short-lived cache of responses keyed by client idempotency tokens.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<String, CachedResponse>,
    default_ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TTL, 10_000)
    }
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache, default_ttl }
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Cached response, unless its TTL has elapsed.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let full_key = Self::full_key(key);
        let entry = self.cache.get(&full_key).await?;
        if entry.is_expired() {
            debug!(key, "Cached response expired");
            self.cache.invalidate(&full_key).await;
            return None;
        }
        Some(entry)
    }

    /// Stores a response, replacing any previous one for the key.
    pub async fn set(
        &self,
        key: &str,
        status_code: u16,
        payload: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.cache
            .insert(Self::full_key(key), CachedResponse::new(status_code, payload, ttl))
            .await;
    }

    pub async fn delete(&self, key: &str) {
        self.cache.invalidate(&Self::full_key(key)).await;
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Live entries after pending evictions are applied.
    pub async fn size(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .count()
    }

    /// Runs `work` once per key and replays its successful response until it expires.
    ///
    /// Concurrent callers with the same key wait for the first one. Failed
    /// responses are returned but not stored.
    pub async fn replay_or_run<F, Fut>(
        &self,
        key: &str,
        work: F,
    ) -> Result<Idempotent<CachedResponse>, WorkflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(u16, serde_json::Value), WorkflowError>>,
    {
        validate_idempotency_key(key)?;
        if let Some(hit) = self.get(key).await {
            workflow_metrics().record_idempotent_replay();
            return Ok(Idempotent::replayed(hit));
        }

        let ran = AtomicBool::new(false);
        let ttl = self.default_ttl;
        let response = self
            .cache
            .try_get_with(Self::full_key(key), async {
                ran.store(true, Ordering::SeqCst);
                let (status_code, payload) = work().await?;
                Ok::<_, WorkflowError>(CachedResponse::new(status_code, payload, ttl))
            })
            .await
            .map_err(|err| (*err).clone())?;

        if ran.load(Ordering::SeqCst) {
            Ok(Idempotent::fresh(response))
        } else {
            workflow_metrics().record_idempotent_replay();
            Ok(Idempotent::replayed(response))
        }
    }
}

/// Client-issued keys must be UUID v4.
pub fn validate_idempotency_key(key: &str) -> Result<(), WorkflowError> {
    match Uuid::parse_str(key) {
        Ok(uuid) if uuid.get_version_num() == 4 => Ok(()),
        _ => Err(WorkflowError::validation(format!(
            "Idempotency key must be a UUID v4, got '{key}'"
        ))),
    }
}
