//! Cross-instance mutual exclusion keyed by goods id.
//!
//! Every reservation and every rollback for the same goods id goes through
//! the same named lock, whichever instance serves it. A [`LockClient`] wraps
//! a [`LockBackend`] (Redis in production, [`InMemoryLockBackend`] in tests)
//! and adds the bounded retry loop: acquisition blocks up to
//! `max_attempts` tries and then fails, it never proceeds unlocked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StockError};

/// Lock key shared by every instance for one goods id.
pub fn lock_key(goods_id: i64) -> String {
    format!("stock-lock-{goods_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8),
            retry_delay: Duration::from_millis(50),
            max_attempts: 32,
        }
    }
}

/// Storage for named, expiring locks visible to all instances.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Stores `token` under `key` with the given expiry if the key is free.
    /// Returns whether the lock was taken.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only while it still holds `token`. Returns whether
    /// anything was deleted.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}

/// Proof of holding a lock until `ttl` runs out.
#[derive(Debug, Clone)]
pub struct LockLease {
    key: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Measured from before the acquire request was sent, so the local view
    /// expires no later than the backend's.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

#[derive(Clone)]
pub struct LockClient {
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
}

impl LockClient {
    pub fn new(backend: Arc<dyn LockBackend>, options: LockOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> LockOptions {
        self.options
    }

    pub async fn acquire(&self, key: &str) -> Result<LockLease> {
        let token = Uuid::new_v4().to_string();
        let attempts = self.options.max_attempts.max(1);

        for attempt in 1..=attempts {
            let acquired_at = Instant::now();
            match self.backend.try_lock(key, &token, self.options.ttl).await {
                Ok(true) => {
                    debug!(key, attempt, "lock acquired");
                    return Ok(LockLease {
                        key: key.to_string(),
                        token,
                        acquired_at,
                        ttl: self.options.ttl,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(key, attempt, error = %e, "lock backend error"),
            }

            if attempt < attempts {
                tokio::time::sleep(self.backoff()).await;
            }
        }

        Err(StockError::LockAcquisitionFailed {
            key: key.to_string(),
            attempts,
        })
    }

    pub async fn release(&self, lease: LockLease) -> Result<()> {
        if self.backend.unlock(&lease.key, &lease.token).await? {
            debug!(key = %lease.key, "lock released");
            Ok(())
        } else {
            Err(StockError::LockNotHeld { key: lease.key })
        }
    }

    fn backoff(&self) -> Duration {
        let base = self.options.retry_delay;
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Process-local lock table. Clones share state, so several engines built on
/// clones behave like separate instances sharing one lock service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockBackend {
    locks: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(locks.get(key), Some((_, deadline)) if *deadline > Instant::now())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some((_, deadline)) = locks.get(key) {
            if *deadline > now {
                return Ok(false);
            }
        }
        locks.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match locks.get(key) {
            Some((holder, deadline)) if holder == token && *deadline > now => {
                locks.remove(key);
                Ok(true)
            }
            Some((_, deadline)) if *deadline <= now => {
                locks.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
