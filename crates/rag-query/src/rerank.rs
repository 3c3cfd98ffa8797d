//! Pairwise reranking of fused retrieval results.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use rag_cache::{TieredCache, NS_RERANK};
use rag_core::{PairwiseScorer, RankedItem, RerankConfig, Result, RetrievedItem, RagError};

/// Weights of the final score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankWeights {
    pub retrieval: f32,
    pub pairwise: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            retrieval: 0.3,
            pairwise: 0.7,
        }
    }
}

/// Rescores retrieval results with a pairwise relevance model.
///
/// `final_score = retrieval * retrieval_score + pairwise * pairwise_score`.
/// A failing model never fails the query: the input is returned ordered by
/// retrieval score instead.
pub struct Reranker {
    scorer: Arc<dyn PairwiseScorer>,
    cache: Arc<TieredCache>,
    ttl: Duration,
    weights: RerankWeights,
    prefix_chars: usize,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn PairwiseScorer>, cache: Arc<TieredCache>) -> Self {
        Self {
            scorer,
            cache,
            ttl: Duration::from_secs(1800),
            weights: RerankWeights::default(),
            prefix_chars: 50,
        }
    }

    /// Apply weights and cache key settings from configuration.
    pub fn configure(mut self, config: &RerankConfig, ttl: Duration) -> Self {
        self.weights = RerankWeights {
            retrieval: config.retrieval_weight,
            pairwise: config.pairwise_weight,
        };
        self.prefix_chars = config.cache_prefix_chars.max(1);
        self.ttl = ttl;
        self
    }

    pub fn weights(&self) -> RerankWeights {
        self.weights
    }

    /// Rank `items` against `query` and return the best `top_k`.
    pub async fn rerank(&self, query: &str, items: &[RetrievedItem], top_k: usize) -> Vec<RankedItem> {
        if items.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let material = self.cache_material(query, items);
        if let Some(mut cached) = self.cache.get_json::<Vec<RankedItem>>(NS_RERANK, &material).await {
            debug!("Rerank cache hit for {} items", items.len());
            cached.truncate(top_k);
            return cached;
        }

        let start = Instant::now();
        match self.score(query, items).await {
            Ok(mut ranked) => {
                debug!(
                    "Reranked {} items in {}ms",
                    items.len(),
                    start.elapsed().as_millis()
                );
                if let Err(e) = self.cache.set_json(NS_RERANK, &material, &ranked, self.ttl).await {
                    warn!("Failed to encode rerank result for cache: {}", e);
                }
                ranked.truncate(top_k);
                ranked
            }
            Err(e) => {
                warn!("Reranking failed, keeping retrieval order: {}", e);
                let mut ranked = passthrough(items);
                ranked.truncate(top_k);
                ranked
            }
        }
    }

    async fn score(&self, query: &str, items: &[RetrievedItem]) -> Result<Vec<RankedItem>> {
        let candidates: Vec<String> = items.iter().map(|i| i.content.clone()).collect();
        let scores = self.scorer.score(query, &candidates).await?;

        if scores.len() != items.len() {
            return Err(RagError::rerank(format!(
                "Scorer returned {} scores for {} candidates",
                scores.len(),
                items.len()
            )));
        }

        let mut ranked: Vec<RankedItem> = items
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(rank, (item, pairwise))| RankedItem {
                content: item.content.clone(),
                final_score: self.weights.retrieval * item.score + self.weights.pairwise * pairwise,
                metadata: item.metadata.clone(),
                original_rank: rank,
            })
            .collect();

        sort_ranked(&mut ranked);
        Ok(ranked)
    }

    /// Query, item count and a digest of each item's leading characters.
    fn cache_material(&self, query: &str, items: &[RetrievedItem]) -> String {
        let mut hasher = blake3::Hasher::new();
        for item in items {
            let prefix: String = item.content.chars().take(self.prefix_chars).collect();
            hasher.update(prefix.as_bytes());
            hasher.update(&[0]);
        }
        format!("{}_{}_{}", query, items.len(), hasher.finalize().to_hex())
    }
}

/// Items in retrieval order mapped to ranked items scored by retrieval.
fn passthrough(items: &[RetrievedItem]) -> Vec<RankedItem> {
    let mut ranked: Vec<RankedItem> = items
        .iter()
        .enumerate()
        .map(|(rank, item)| RankedItem {
            content: item.content.clone(),
            final_score: item.score,
            metadata: item.metadata.clone(),
            original_rank: rank,
        })
        .collect();
    sort_ranked(&mut ranked);
    ranked
}

/// Descending by final score; ties by original rank.
fn sort_ranked(ranked: &mut [RankedItem]) {
    ranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(Ordering::Equal)
            .then(a.original_rank.cmp(&b.original_rank))
    });
}
