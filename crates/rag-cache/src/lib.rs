//! rag-cache - Tiered cache for the query pipeline
//!
//! Content-addressed key/value storage with TTL, consulted for query
//! enhancement, reranking and full responses.
//!
//! # Tiers
//!
//! - [`MemoryTier`]: bounded in-process map, always available. Evicts the
//!   oldest ~10% of entries (insertion order) when full.
//! - [`RedisTier`]: optional shared tier. Best-effort: failures are logged
//!   and the in-process tier answers alone.
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_cache::TieredCache;
//! use std::time::Duration;
//!
//! let cache = TieredCache::new(1000);
//! cache.set("full_response", "age of retirement", b"60".to_vec(), Duration::from_secs(1800)).await;
//! assert_eq!(cache.get("full_response", "age of retirement").await, Some(b"60".to_vec()));
//! ```

mod memory;
mod shared;
mod tiered;

pub use memory::MemoryTier;
pub use shared::{RedisTier, SharedTier};
pub use tiered::{cache_key, CacheStats, TieredCache, TiersWritten};

/// Namespace for query enhancement variants.
pub const NS_QUERY_ENHANCEMENT: &str = "query_enhancement";

/// Namespace for rerank results.
pub const NS_RERANK: &str = "rerank";

/// Namespace for full structured responses.
pub const NS_FULL_RESPONSE: &str = "full_response";
