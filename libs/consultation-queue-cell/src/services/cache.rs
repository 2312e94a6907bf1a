use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::QueueError;

/// Key/value cache with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), QueueError>;
    async fn delete(&self, key: &str) -> Result<(), QueueError>;
}

pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    pub async fn new(redis_url: &str) -> Result<Self, QueueError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            QueueError::RedisError(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to create Redis pool",
                format!("Pool creation error: {}", e),
            )))
        })?;

        let store = Self { pool };

        // Test connection
        let mut conn = store.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis cache store initialized successfully");

        Ok(store)
    }

    async fn get_connection(&self) -> Result<Connection, QueueError> {
        self.pool.get().await.map_err(|e| {
            QueueError::RedisError(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get Redis connection",
                e.to_string(),
            )))
        })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.del(key).await?;
        debug!("Deleted cache key {}", key);
        Ok(())
    }
}

/// Process-local cache used when Redis is not configured, and in tests.
pub struct InMemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|(_, expires_at)| *expires_at > now).count()
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), QueueError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
