//! Idempotency guard — run an operation at most once per key within a TTL window.
//!
//! The claim is taken with an atomic set-if-absent in a shared store, so the
//! guard holds across tasks, loops and process replicas. A caller that fails
//! to claim a key must treat it as "someone else is handling or already
//! handled this", never as an error.
//!
//! What happens to the claim when the operation fails is a [`ClaimPolicy`]:
//!
//! - [`ClaimPolicy::HoldUntilExpiry`]: the claim is never released and expires
//!   at its TTL. This gives at-most-once per TTL; after a failure the same key
//!   can be retried only once the TTL has elapsed.
//! - [`ClaimPolicy::ReleaseOnFailure`]: the claim is deleted when the operation
//!   returns an error, so the next cycle can retry at once. A failure that
//!   happens after the side effect (e.g. the status update after a successful
//!   send) can then repeat the side effect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use beacon_common::error::AppError;

/// Shared set-if-absent store backing the guard.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `key` for `ttl`. Returns `false` if the key is already held.
    async fn claim_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Drop a claim before its TTL.
    async fn release(&self, key: &str) -> Result<(), AppError>;
}

/// What to do with a claim when the guarded operation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimPolicy {
    /// Keep the claim until it expires.
    #[default]
    HoldUntilExpiry,
    /// Delete the claim so the operation can be retried immediately.
    ReleaseOnFailure,
}

/// Outcome of a guarded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    /// The key was claimed and the operation ran.
    Executed(T),
    /// The key was already held; the operation did not run.
    AlreadyClaimed,
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    policy: ClaimPolicy,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    /// Drop a claim early, e.g. once the row it protected is due for another attempt.
    pub async fn release(&self, key: &str) -> Result<(), AppError> {
        self.store
            .release(key)
            .await
            .map_err(|e| AppError::Guard(format!("failed to release {}: {}", key, e)))
    }

    /// Run `op` if `key` can be claimed for `ttl`.
    ///
    /// A store failure is returned as [`AppError::Guard`] and `op` is not run.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<GuardOutcome<T>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let claimed = self
            .store
            .claim_if_absent(key, ttl)
            .await
            .map_err(|e| AppError::Guard(format!("failed to claim {}: {}", key, e)))?;

        if !claimed {
            tracing::debug!(key, "Key already claimed, skipping");
            return Ok(GuardOutcome::AlreadyClaimed);
        }

        match op().await {
            Ok(value) => Ok(GuardOutcome::Executed(value)),
            Err(e) => {
                if self.policy == ClaimPolicy::ReleaseOnFailure
                    && let Err(release_err) = self.store.release(key).await
                {
                    tracing::warn!(
                        key,
                        error = %release_err,
                        "Failed to release claim, it will expire at its TTL"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Redis-backed claims using `SET key 1 NX PX ttl_ms`.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "idempotency")
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn claim_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        // Some("OK") if the key was set, None if it already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.redis_key(key)).await?;
        Ok(())
    }
}

/// In-process claims, expiring on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    claims: Mutex<HashMap<String, Instant>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        let claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.retain(|_, expires_at| *expires_at > now);

        if claims.contains_key(key) {
            return Ok(false);
        }
        claims.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
