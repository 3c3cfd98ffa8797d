//! Shared (cross-process) cache tier.

use std::time::Duration;

use async_trait::async_trait;
use rag_core::{RagError, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

/// Per-operation bound for the shared tier.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound for establishing the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A key/value store reachable by every instance of the pipeline.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Fetch a value, `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Redis-backed shared tier.
#[derive(Clone)]
pub struct RedisTier {
    conn: ConnectionManager,
}

impl RedisTier {
    /// Connect to the given `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RagError::cache(format!("Invalid redis URL: {}", e)))?;

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| RagError::cache("Timed out connecting to redis"))?
            .map_err(|e| RagError::cache(format!("Failed to connect to redis: {}", e)))?;

        info!("Connected to shared cache tier");
        Ok(Self { conn })
    }

    async fn bounded<T, F>(op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| RagError::cache(format!("redis {} timed out", op)))?
            .map_err(|e| RagError::cache(format!("redis {} failed: {}", op, e)))
    }
}

#[async_trait]
impl SharedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Self::bounded("GET", async move { conn.get::<_, Option<Vec<u8>>>(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl_secs.max(1);
        Self::bounded("SETEX", async move {
            conn.set_ex::<_, _, ()>(key, value, ttl_secs).await
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        let keys: Vec<String> = Self::bounded("SCAN", async {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok::<_, redis::RedisError>(keys)
        })
        .await?;

        if keys.is_empty() {
            return Ok(0);
        }

        let removed: u64 =
            Self::bounded("DEL", async { conn.del(keys.as_slice()).await }).await?;
        debug!("Removed {} shared keys matching {}", removed, pattern);
        Ok(removed)
    }
}
