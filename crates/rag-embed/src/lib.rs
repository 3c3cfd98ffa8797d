//! rag-embed - Embedding backends
//!
//! Turns text into fixed-size vectors for the dense retrieval path.
//!
//! # Backends
//!
//! - [`HashingEmbedder`]: local, deterministic feature hashing. Default.
//! - [`HttpEmbedder`]: OpenAI-compatible `/v1/embeddings` endpoint.

mod hashing;
mod http;

use std::sync::Arc;

pub use hashing::HashingEmbedder;
pub use http::HttpEmbedder;

// Re-export the Embedder trait for convenience
pub use rag_core::Embedder;

use rag_core::{EmbedderKind, EmbeddingConfig, RagError, Result};

const DEFAULT_HTTP_MODEL: &str = "text-embedding-3-small";

/// Build the embedder selected by configuration.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.kind {
        EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension)?)),
        EmbedderKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| RagError::config("embedding.endpoint is required for kind = \"http\""))?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_HTTP_MODEL.to_string());
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.trim().is_empty());

            Ok(Arc::new(HttpEmbedder::new(
                endpoint,
                model,
                api_key,
                config.dimension,
            )?))
        }
    }
}
