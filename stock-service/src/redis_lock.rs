//! Redis-backed lock storage.
//!
//! - **Acquire**: `SET key token NX PX ttl`, atomic set-if-absent with expiry.
//! - **Release**: Lua compare-and-delete, so a caller whose lease expired can
//!   never delete a lock that another instance has since taken.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use crate::error::Result;
use crate::lock::LockBackend;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockBackend {
    conn_manager: ConnectionManager,
    release_script: Script,
}

impl RedisLockBackend {
    /// Connects to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns error if the URL is malformed or the server is unreachable.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;

        tracing::info!("RedisLockBackend initialized successfully");

        Ok(Self {
            conn_manager,
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();

        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }
}
