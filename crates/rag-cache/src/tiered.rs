//! Two-tier cache front end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rag_core::{CacheConfig, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::MemoryTier;
use crate::shared::{RedisTier, SharedTier};
use crate::{NS_FULL_RESPONSE, NS_QUERY_ENHANCEMENT, NS_RERANK};

/// Derive the storage key for `material` under `namespace`.
///
/// The digest is the first 128 bits of blake3 over the raw material, so
/// the same material always maps to the same key.
pub fn cache_key(namespace: &str, material: &str) -> String {
    let digest = blake3::hash(material.as_bytes());
    format!("{}:{}", namespace, hex::encode(&digest.as_bytes()[..16]))
}

/// Which tiers accepted a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TiersWritten {
    pub memory: bool,
    pub shared: bool,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits_shared: u64,
    pub hits_memory: u64,
    pub misses: u64,
    pub writes: u64,
    pub shared_errors: u64,
    pub memory_entries: u64,
    pub shared_enabled: bool,
}

#[derive(Default)]
struct Counters {
    hits_shared: AtomicU64,
    hits_memory: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    shared_errors: AtomicU64,
}

/// Cache consulted by every pipeline stage.
///
/// Reads try the shared tier first and fall back to the in-process tier.
/// Writes go to both. The cache never fails a caller: shared-tier errors
/// are logged and counted, and the operation continues in memory.
pub struct TieredCache {
    memory: MemoryTier,
    shared: Option<Arc<dyn SharedTier>>,
    counters: Counters,
}

impl TieredCache {
    /// Memory-only cache.
    pub fn new(memory_capacity: usize) -> Self {
        Self {
            memory: MemoryTier::new(memory_capacity),
            shared: None,
            counters: Counters::default(),
        }
    }

    /// Attach a shared tier.
    pub fn with_shared(mut self, shared: Arc<dyn SharedTier>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Build from configuration, degrading to memory-only when the shared
    /// tier is unreachable.
    pub async fn connect(config: &CacheConfig) -> Self {
        let cache = Self::new(config.memory_capacity);

        let Some(url) = config.redis_url.as_deref() else {
            info!("Cache running in memory-only mode");
            return cache;
        };

        match RedisTier::connect(url).await {
            Ok(tier) => cache.with_shared(Arc::new(tier)),
            Err(e) => {
                warn!("Shared cache tier unavailable, using memory only: {}", e);
                cache
            }
        }
    }

    pub fn has_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Look up `material` in `namespace`.
    pub async fn get(&self, namespace: &str, material: &str) -> Option<Vec<u8>> {
        let key = cache_key(namespace, material);

        if let Some(shared) = &self.shared {
            match shared.get(&key).await {
                Ok(Some(value)) => {
                    self.counters.hits_shared.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit (shared) {}", key);
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Shared cache read failed for {}: {}", key, e);
                }
            }
        }

        match self.memory.get(&key) {
            Some(value) => {
                self.counters.hits_memory.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit (memory) {}", key);
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` for `material` in `namespace` with the given TTL.
    pub async fn set(
        &self,
        namespace: &str,
        material: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> TiersWritten {
        let key = cache_key(namespace, material);
        let mut written = TiersWritten::default();

        if let Some(shared) = &self.shared {
            match shared.set_ex(&key, &value, ttl.as_secs()).await {
                Ok(()) => written.shared = true,
                Err(e) => {
                    self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Shared cache write failed for {}: {}", key, e);
                }
            }
        }

        self.memory.set(&key, value, ttl);
        written.memory = true;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        written
    }

    /// Typed lookup. Undecodable entries count as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, namespace: &str, material: &str) -> Option<T> {
        let bytes = self.get(namespace, material).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry in {}: {}", namespace, e);
                None
            }
        }
    }

    /// Typed store.
    pub async fn set_json<T: Serialize>(
        &self,
        namespace: &str,
        material: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<TiersWritten> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.set(namespace, material, bytes, ttl).await)
    }

    /// Drop every entry of a namespace from both tiers.
    pub async fn invalidate_namespace(&self, namespace: &str) -> u64 {
        let prefix = format!("{}:", namespace);
        let mut removed = self.memory.remove_prefix(&prefix) as u64;

        if let Some(shared) = &self.shared {
            match shared.delete_prefix(&prefix).await {
                Ok(n) => removed += n,
                Err(e) => {
                    self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Shared cache invalidation failed for {}: {}", namespace, e);
                }
            }
        }

        info!("Invalidated {} cache entries in {}", removed, namespace);
        removed
    }

    /// Drop every pipeline namespace from both tiers.
    pub async fn clear(&self) -> u64 {
        self.memory.clear();
        let mut removed = 0;
        for namespace in [NS_QUERY_ENHANCEMENT, NS_RERANK, NS_FULL_RESPONSE] {
            removed += self.invalidate_namespace(namespace).await;
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits_shared: self.counters.hits_shared.load(Ordering::Relaxed),
            hits_memory: self.counters.hits_memory.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            shared_errors: self.counters.shared_errors.load(Ordering::Relaxed),
            memory_entries: self.memory.len() as u64,
            shared_enabled: self.shared.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rag_core::RagError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const TTL: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct MapTier {
        entries: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl SharedTier for MapTier {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set_ex(&self, key: &str, value: &[u8], _ttl_secs: u64) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            Ok((before - entries.len()) as u64)
        }
    }

    struct DownTier;

    #[async_trait]
    impl SharedTier for DownTier {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(RagError::cache("connection refused"))
        }

        async fn set_ex(&self, _key: &str, _value: &[u8], _ttl_secs: u64) -> Result<()> {
            Err(RagError::cache("connection refused"))
        }

        async fn delete_prefix(&self, _prefix: &str) -> Result<u64> {
            Err(RagError::cache("connection refused"))
        }
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = cache_key(NS_RERANK, "quel âge pour la retraite");
        let b = cache_key(NS_RERANK, "quel âge pour la retraite");
        let c = cache_key(NS_FULL_RESPONSE, "quel âge pour la retraite");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("rerank:"));
        assert_eq!(a.len(), "rerank:".len() + 32);
    }

    #[tokio::test]
    async fn test_memory_only_round_trip() {
        let cache = TieredCache::new(10);
        assert_eq!(cache.get(NS_RERANK, "q").await, None);

        let written = cache.set(NS_RERANK, "q", b"v".to_vec(), TTL).await;
        assert_eq!(
            written,
            TiersWritten {
                memory: true,
                shared: false
            }
        );
        assert_eq!(cache.get(NS_RERANK, "q").await, Some(b"v".to_vec()));

        let stats = cache.stats();
        assert_eq!(stats.hits_memory, 1);
        assert_eq!(stats.misses, 1);
        assert!(!stats.shared_enabled);
    }

    #[tokio::test]
    async fn test_shared_tier_is_consulted_first() {
        let shared = Arc::new(MapTier::default());
        let cache = TieredCache::new(10).with_shared(shared.clone());

        let written = cache.set(NS_FULL_RESPONSE, "q", b"v".to_vec(), TTL).await;
        assert!(written.shared && written.memory);

        // Another instance wrote a newer value to the shared tier.
        shared
            .set_ex(&cache_key(NS_FULL_RESPONSE, "q"), b"fresh", 60)
            .await
            .unwrap();

        assert_eq!(cache.get(NS_FULL_RESPONSE, "q").await, Some(b"fresh".to_vec()));
        assert_eq!(cache.stats().hits_shared, 1);
    }

    #[tokio::test]
    async fn test_failing_shared_tier_degrades_to_memory() {
        let cache = TieredCache::new(10).with_shared(Arc::new(DownTier));

        let written = cache.set(NS_QUERY_ENHANCEMENT, "q", b"v".to_vec(), TTL).await;
        assert_eq!(
            written,
            TiersWritten {
                memory: true,
                shared: false
            }
        );
        assert_eq!(cache.get(NS_QUERY_ENHANCEMENT, "q").await, Some(b"v".to_vec()));
        assert_eq!(cache.stats().shared_errors, 2);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = TieredCache::new(10);
        let variants = vec!["a".to_string(), "b".to_string()];
        cache
            .set_json(NS_QUERY_ENHANCEMENT, "q", &variants, TTL)
            .await
            .unwrap();

        let back: Option<Vec<String>> = cache.get_json(NS_QUERY_ENHANCEMENT, "q").await;
        assert_eq!(back, Some(variants));

        cache.set(NS_RERANK, "bad", b"not json".to_vec(), TTL).await;
        let bad: Option<Vec<String>> = cache.get_json(NS_RERANK, "bad").await;
        assert_eq!(bad, None);
    }

    #[tokio::test]
    async fn test_invalidate_namespace_spares_others() {
        let shared = Arc::new(MapTier::default());
        let cache = TieredCache::new(10).with_shared(shared.clone());

        cache.set(NS_RERANK, "a", b"1".to_vec(), TTL).await;
        cache.set(NS_FULL_RESPONSE, "a", b"2".to_vec(), TTL).await;

        // One entry per tier.
        assert_eq!(cache.invalidate_namespace(NS_RERANK).await, 2);
        assert_eq!(cache.get(NS_RERANK, "a").await, None);
        assert_eq!(cache.get(NS_FULL_RESPONSE, "a").await, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_empties_all_namespaces() {
        let shared = Arc::new(MapTier::default());
        let cache = TieredCache::new(10).with_shared(shared.clone());

        cache.set(NS_RERANK, "a", b"1".to_vec(), TTL).await;
        cache.set(NS_QUERY_ENHANCEMENT, "a", b"2".to_vec(), TTL).await;
        cache.clear().await;

        assert_eq!(cache.stats().memory_entries, 0);
        assert!(shared.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_url_is_memory_only() {
        let config = CacheConfig {
            redis_url: None,
            ..CacheConfig::default()
        };
        let cache = TieredCache::connect(&config).await;
        assert!(!cache.has_shared());
    }
}
