//! Core traits defining the interfaces between components.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{CorpusChunk, GenerationParams, ProviderProfile, VectorHit};

/// Embedding model trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of document texts.
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;
}

/// Nearest-neighbour lookup over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `k` chunks closest to `embedding`, nearest first.
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>>;
}

/// Source of the current corpus, used to (re)build the sparse index.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// All chunks in a stable order.
    async fn snapshot(&self) -> Result<Vec<CorpusChunk>>;
}

/// Joint relevance model over (query, candidate) pairs.
#[async_trait]
pub trait PairwiseScorer: Send + Sync {
    /// One score per candidate, aligned with the input order.
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// A text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Static profile of the backend.
    fn profile(&self) -> &ProviderProfile;

    /// Single-shot generation.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Incremental generation. Dropping the returned stream cancels the request.
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream>;
}

/// Finite, non-restartable sequence of generated text fragments.
///
/// Backed by a bounded channel: the producer stops as soon as this value is
/// dropped.
#[derive(Debug)]
pub struct TextStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TextStream {
    /// Create a producer/consumer pair with the given buffer capacity.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<String>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Build a stream that yields the given fragments and then ends.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments: Vec<String> = fragments.into_iter().map(Into::into).collect();
        let (tx, stream) = Self::channel(fragments.len() + 1);
        for fragment in fragments {
            // Capacity covers every fragment, so this never fails.
            let _ = tx.try_send(Ok(fragment));
        }
        stream
    }

    /// Receive the next fragment.
    pub async fn next_fragment(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Drain the stream into one string, failing on the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next_fragment().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for TextStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_from_fragments_collects() {
        let stream = TextStream::from_fragments(["La ", "retraite ", "est à 60 ans."]);
        assert_eq!(stream.collect_text().await.unwrap(), "La retraite est à 60 ans.");
    }

    #[tokio::test]
    async fn test_stream_trait_yields_in_order() {
        let stream = TextStream::from_fragments(vec!["a", "b"]);
        let items: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_collect_stops_on_error() {
        let (tx, stream) = TextStream::channel(4);
        tx.send(Ok("partial".to_string())).await.unwrap();
        tx.send(Err(RagError::malformed_stream("bad"))).await.unwrap();
        drop(tx);
        assert!(stream.collect_text().await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_consumer_closes_producer() {
        let (tx, stream) = TextStream::channel(1);
        drop(stream);
        assert!(tx.is_closed());
        assert!(tx.send(Ok("late".to_string())).await.is_err());
    }
}
