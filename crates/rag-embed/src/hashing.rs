//! Local feature-hashing embedder.

use async_trait::async_trait;
use rag_core::{Embedder, RagError, Result};

/// Deterministic bag-of-words embedder.
///
/// Lowercased word unigrams and bigrams are hashed (blake3) into a fixed
/// number of signed buckets, then L2-normalized. Texts sharing vocabulary
/// land close together under cosine distance, which is all the dense path
/// needs when no model server is configured.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::config("Embedding dimension must be positive"));
        }
        Ok(Self { dimension })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        let mut embedding = vec![0.0f32; self.dimension];
        for word in &words {
            self.add_feature(&mut embedding, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut embedding, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }

    fn add_feature(&self, embedding: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        embedding[(bucket % self.dimension as u64) as usize] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
