//! Okapi BM25 sparse index with snapshot swap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use rag_core::{BlockingPool, CorpusChunk, CorpusSource, Result};

/// BM25 tuning constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalization.
    pub b: f32,
    /// Floor for negative IDF, as a fraction of the average IDF.
    pub epsilon: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

/// Lowercase and split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Immutable scoring state built from one corpus snapshot.
#[derive(Default)]
struct Snapshot {
    chunks: Vec<CorpusChunk>,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<f32>,
    avg_doc_len: f32,
    idf: HashMap<String, f32>,
}

impl Snapshot {
    fn build(chunks: Vec<CorpusChunk>, params: Bm25Params) -> Self {
        let mut term_freqs = Vec::with_capacity(chunks.len());
        let mut doc_lens = Vec::with_capacity(chunks.len());
        let mut doc_counts: HashMap<String, u32> = HashMap::new();

        for chunk in &chunks {
            let tokens = tokenize(&chunk.content);
            doc_lens.push(tokens.len() as f32);

            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_default() += 1;
            }
            for term in freqs.keys() {
                *doc_counts.entry(term.clone()).or_default() += 1;
            }
            term_freqs.push(freqs);
        }

        let total_len: f32 = doc_lens.iter().sum();
        let avg_doc_len = if chunks.is_empty() {
            0.0
        } else {
            total_len / chunks.len() as f32
        };

        let n = chunks.len() as f32;
        let mut idf = HashMap::with_capacity(doc_counts.len());
        let mut idf_sum = 0.0f32;
        let mut negative = Vec::new();
        for (term, count) in doc_counts {
            let count = count as f32;
            let value = (n - count + 0.5).ln() - (count + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term, value);
        }

        if !idf.is_empty() {
            let floor = params.epsilon * idf_sum / idf.len() as f32;
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Self {
            chunks,
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        }
    }

    fn score_all(&self, tokens: &[String], params: Bm25Params) -> Vec<f32> {
        let avg = if self.avg_doc_len > 0.0 {
            self.avg_doc_len
        } else {
            1.0
        };

        self.term_freqs
            .iter()
            .zip(&self.doc_lens)
            .map(|(freqs, &len)| {
                tokens
                    .iter()
                    .map(|token| {
                        let tf = freqs.get(token).copied().unwrap_or(0) as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let idf = self.idf.get(token).copied().unwrap_or(0.0);
                        idf * (tf * (params.k1 + 1.0))
                            / (tf + params.k1 * (1.0 - params.b + params.b * len / avg))
                    })
                    .sum()
            })
            .collect()
    }
}

/// Lexical index read by concurrent queries and rebuilt out of band.
///
/// Readers clone the current `Arc<Snapshot>` and score against it without
/// holding the lock; a rebuild constructs a new snapshot off the async
/// threads and swaps the pointer. Reads during a rebuild see the previous
/// corpus.
pub struct SparseIndex {
    current: RwLock<Arc<Snapshot>>,
    pool: BlockingPool,
    params: Bm25Params,
}

impl SparseIndex {
    /// Empty index; queries return nothing until the first rebuild.
    pub fn new(pool: BlockingPool) -> Self {
        Self::with_params(pool, Bm25Params::default())
    }

    pub fn with_params(pool: BlockingPool, params: Bm25Params) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            pool,
            params,
        }
    }

    /// Number of indexed chunks in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild from the corpus source and swap it in.
    pub async fn rebuild(&self, source: &dyn CorpusSource) -> Result<usize> {
        let chunks = source.snapshot().await?;
        self.rebuild_from(chunks).await
    }

    /// Rebuild from an explicit chunk list and swap it in.
    pub async fn rebuild_from(&self, chunks: Vec<CorpusChunk>) -> Result<usize> {
        let params = self.params;
        let snapshot = self
            .pool
            .run(move || Snapshot::build(chunks, params))
            .await?;
        let count = snapshot.chunks.len();

        match self.current.write() {
            Ok(mut current) => *current = Arc::new(snapshot),
            Err(poisoned) => {
                warn!("Sparse index lock poisoned, replacing snapshot anyway");
                *poisoned.into_inner() = Arc::new(snapshot);
            }
        }

        info!("Sparse index rebuilt with {} chunks", count);
        Ok(count)
    }

    /// BM25 score of every indexed chunk, in snapshot order.
    pub async fn score_all(&self, tokens: Vec<String>) -> Result<Vec<f32>> {
        let snapshot = self.snapshot();
        let params = self.params;
        self.pool
            .run(move || snapshot.score_all(&tokens, params))
            .await
    }

    /// The `n` best chunks for `query` with a positive score, best first.
    pub async fn top_n(&self, query: &str, n: usize) -> Result<Vec<(CorpusChunk, f32)>> {
        let snapshot = self.snapshot();
        if n == 0 || snapshot.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = tokenize(query);
        let params = self.params;
        self.pool
            .run(move || {
                let scores = snapshot.score_all(&tokens, params);
                let mut ranked: Vec<(usize, f32)> = scores
                    .into_iter()
                    .enumerate()
                    .filter(|(_, score)| *score > 0.0)
                    .collect();
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                ranked.truncate(n);
                ranked
                    .into_iter()
                    .map(|(i, score)| (snapshot.chunks[i].clone(), score))
                    .collect()
            })
            .await
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
