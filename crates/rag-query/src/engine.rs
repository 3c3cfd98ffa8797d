//! Hybrid (dense + sparse) retrieval engine.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use rag_core::{Embedder, Origin, RagError, Result, RetrievedItem, VectorIndex};

use crate::bm25::SparseIndex;
use crate::fusion::fuse_and_dedup;

/// Default cap on dense candidates per query.
pub const DEFAULT_DENSE_CAP: usize = 20;

/// Per-query hybrid search over a vector index and a BM25 index.
///
/// Either path may fail or be empty; it then contributes nothing and the
/// search continues with the other. Only invalid arguments are errors.
pub struct HybridSearch {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    sparse: Arc<SparseIndex>,
    dense_cap: usize,
}

impl HybridSearch {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        sparse: Arc<SparseIndex>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            sparse,
            dense_cap: DEFAULT_DENSE_CAP,
        }
    }

    /// Cap on the number of dense candidates fetched per query.
    pub fn with_dense_cap(mut self, dense_cap: usize) -> Self {
        self.dense_cap = dense_cap.max(1);
        self
    }

    pub fn sparse_index(&self) -> &Arc<SparseIndex> {
        &self.sparse
    }

    /// Search `query`, weighting dense scores by `alpha` and sparse scores
    /// by `1 - alpha`.
    pub async fn search(&self, query: &str, n_results: usize, alpha: f32) -> Result<Vec<RetrievedItem>> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(RagError::invalid_argument(format!(
                "alpha must be within [0, 1], got {}",
                alpha
            )));
        }
        if n_results == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();

        let (dense, sparse) = tokio::join!(
            self.dense_path(query, n_results, alpha),
            self.sparse_path(query, n_results, alpha)
        );

        let dense = dense.unwrap_or_else(|e| {
            warn!("Dense retrieval degraded: {}", e);
            Vec::new()
        });
        let sparse = sparse.unwrap_or_else(|e| {
            warn!("Sparse retrieval degraded: {}", e);
            Vec::new()
        });

        debug!(
            "Dense returned {} results, sparse returned {} results",
            dense.len(),
            sparse.len()
        );

        let fused = fuse_and_dedup(dense, sparse, n_results);

        debug!(
            "Hybrid search for {:?} fused to {} results in {}ms",
            query,
            fused.len(),
            start.elapsed().as_millis()
        );

        Ok(fused)
    }

    async fn dense_path(&self, query: &str, n_results: usize, alpha: f32) -> Result<Vec<RetrievedItem>> {
        let k = n_results.saturating_mul(2).min(self.dense_cap);
        let embedding = self.embedder.embed_query(query).await?;
        let hits = self.vectors.query(&embedding, k).await?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                let similarity = 1.0 / (1.0 + hit.distance.max(0.0));
                RetrievedItem::new(hit.content, similarity * alpha, hit.metadata, Origin::Dense)
            })
            .collect())
    }

    async fn sparse_path(&self, query: &str, n_results: usize, alpha: f32) -> Result<Vec<RetrievedItem>> {
        let hits = self.sparse.top_n(query, n_results).await?;

        Ok(hits
            .into_iter()
            .map(|(chunk, score)| {
                RetrievedItem::new(chunk.content, score * (1.0 - alpha), chunk.metadata, Origin::Sparse)
            })
            .collect())
    }
}
