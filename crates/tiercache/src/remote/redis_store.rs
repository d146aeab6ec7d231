//! Redis adapter for the remote tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use super::{RemoteStore, RemoteValue};
use crate::config::RedisConfig;
use crate::error::RemoteError;
use crate::pattern::KeyPattern;

/// Keys requested per `SCAN` round-trip during pattern deletes.
const SCAN_BATCH: usize = 100;

/// Remote tier backed by a Redis connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError> {
        let mut conn = self.pool.get().await?;

        // GET and PTTL in one MULTI so the TTL belongs to the value we read
        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;

        Ok(data.map(|data| RemoteValue {
            data,
            // -1: no expiry, -2: key vanished between commands (not possible in MULTI)
            ttl: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn set(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, data, ttl_ms).await?;
        tracing::debug!(key = %key, ttl_ms = %ttl_ms, "cache set (L2)");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, RemoteError> {
        if pattern.is_exact() {
            return Ok(usize::from(self.delete(pattern.as_str()).await?));
        }

        let mut conn = self.pool.get().await?;
        let glob = pattern.to_redis_glob();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            let keys: Vec<String> = keys.into_iter().filter(|k| pattern.matches(k)).collect();
            if !keys.is_empty() {
                let n: usize = conn.del(&keys).await?;
                removed += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(pattern = %pattern.as_str(), removed = removed, "pattern delete (L2)");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists(key).await?)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.pool.get().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(RemoteError::Protocol(format!("unexpected PING reply: {pong}")))
        }
    }
}

/// Build the Redis tier from configuration.
///
/// ## Graceful Degradation
///
/// - **Redis disabled**: returns `None`; the cache runs L1-only
/// - **Pool cannot be built** (malformed URL): logs and returns `None`
/// - **Redis unreachable at startup**: logs a warning but keeps the pool,
///   which reconnects lazily once Redis comes back
pub async fn connect_redis(config: &RedisConfig) -> Option<Arc<RedisStore>> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return None;
        }
    };

    let store = RedisStore::new(pool);
    match store.ping().await {
        Ok(()) => tracing::info!("Connected to Redis successfully"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis not reachable yet; L2 calls will degrade to misses until it is"
        ),
    }

    Some(Arc::new(store))
}
