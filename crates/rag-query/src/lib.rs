//! rag-query - Hybrid retrieval and reranking
//!
//! This crate turns a query into a ranked list of corpus chunks by
//! combining dense vector search with BM25 keyword search.
//!
//! # Features
//!
//! - Weighted fusion: `alpha * dense + (1 - alpha) * sparse`
//! - Deduplication by full-content fingerprint
//! - BM25 index with lock-free reads during rebuilds
//! - Pairwise reranking with a cached, fail-open path
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_query::{HybridSearch, SparseIndex};
//! use std::sync::Arc;
//!
//! let sparse = Arc::new(SparseIndex::new(pool));
//! sparse.rebuild(store.as_ref()).await?;
//! let engine = HybridSearch::new(embedder, store, sparse);
//! let results = engine.search("âge de la retraite", 15, 0.7).await?;
//! ```

mod bm25;
mod engine;
mod fusion;
mod rerank;
mod scorers;

use std::sync::Arc;

pub use bm25::{tokenize, Bm25Params, SparseIndex};
pub use engine::{HybridSearch, DEFAULT_DENSE_CAP};
pub use fusion::{dedup_by_content, fuse_and_dedup, sort_by_score};
pub use rerank::{RerankWeights, Reranker};
pub use scorers::{HttpCrossEncoder, LexicalPairwiseScorer};

use rag_core::{BlockingPool, PairwiseScorer, RerankConfig, Result};

/// Build the pairwise scorer selected by configuration.
pub fn scorer_from_config(config: &RerankConfig, pool: BlockingPool) -> Result<Arc<dyn PairwiseScorer>> {
    match config.endpoint.as_deref() {
        Some(endpoint) => Ok(Arc::new(HttpCrossEncoder::new(endpoint)?)),
        None => Ok(Arc::new(LexicalPairwiseScorer::new(pool))),
    }
}
