//! Configuration types for the query pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Provider, ProviderProfile};

/// Main configuration for the query pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Hybrid retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Reranking configuration.
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Predefined answers configuration.
    #[serde(default)]
    pub predefined: PredefinedConfig,

    /// Generation backend configuration.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Orchestration limits.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Which embedder implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Local deterministic feature hashing.
    Hashing,
    /// OpenAI-compatible embeddings endpoint.
    Http,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedder_kind")]
    pub kind: EmbedderKind,

    /// Vector dimension.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Embeddings endpoint (http kind only).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Embedding model name (http kind only).
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the embeddings API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Hashing,
            dimension: 384,
            endpoint: None,
            model: None,
            api_key_env: None,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Shared tier URL (`redis://host:port/db`). In-process only when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Maximum entries kept in the in-process tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// TTL for query enhancement results.
    #[serde(default = "default_enhancement_ttl")]
    pub enhancement_ttl_secs: u64,

    /// TTL for rerank results.
    #[serde(default = "default_rerank_ttl")]
    pub rerank_ttl_secs: u64,

    /// TTL for full responses.
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            memory_capacity: 1000,
            enhancement_ttl_secs: 3600,
            rerank_ttl_secs: 1800,
            response_ttl_secs: 1800,
        }
    }
}

/// Hybrid retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Dense weight (0 = sparse only, 1 = dense only).
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Results requested per query variant.
    #[serde(default = "default_n_results")]
    pub n_results: usize,

    /// Upper bound on dense candidates per query.
    #[serde(default = "default_dense_cap")]
    pub dense_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            n_results: 15,
            dense_cap: 20,
        }
    }
}

/// Reranking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "default_retrieval_weight")]
    pub retrieval_weight: f32,

    #[serde(default = "default_pairwise_weight")]
    pub pairwise_weight: f32,

    /// Characters of each item hashed into the rerank cache key.
    #[serde(default = "default_cache_prefix_chars")]
    pub cache_prefix_chars: usize,

    /// Cross-encoder `/rerank` endpoint. Lexical scoring when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            retrieval_weight: 0.3,
            pairwise_weight: 0.7,
            cache_prefix_chars: 50,
            endpoint: None,
        }
    }
}

/// Predefined answers configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// TOML file of extra rules, appended to the built-in table.
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

impl Default for PredefinedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            rules_path: None,
        }
    }
}

/// Per-provider overrides of the built-in profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub default_provider: Provider,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Timeout for single-shot calls.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Timeout for streaming calls.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    /// Overrides keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderOverride>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_provider: Provider::Mistral,
            temperature: 0.3,
            max_tokens: 512,
            timeout_secs: 30,
            stream_timeout_secs: 60,
            providers: BTreeMap::new(),
        }
    }
}

impl GenerationConfig {
    /// Built-in profile with configured overrides applied.
    pub fn profile_for(&self, provider: Provider) -> ProviderProfile {
        let mut profile = ProviderProfile::builtin(provider);
        if let Some(overrides) = self.providers.get(provider.as_str()) {
            if let Some(url) = &overrides.endpoint_url {
                profile.endpoint_url = url.clone();
            }
            if let Some(model) = &overrides.model {
                profile.model_name = model.clone();
            }
        }
        profile
    }

    /// Resolve the API key for a provider from the environment.
    pub fn api_key_for(&self, provider: Provider) -> Option<String> {
        let var = self
            .providers
            .get(provider.as_str())
            .and_then(|o| o.api_key_env.clone())
            .unwrap_or_else(|| provider.api_key_env().to_string());

        std::env::var(var).ok().filter(|key| !key.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

/// Orchestration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Overall deadline for one request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Concurrent CPU-bound jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Buffered events between producer and consumer when streaming.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Ranked sources passed to the prompt when the caller does not say.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            workers: 4,
            stream_buffer: 32,
            default_top_k: 3,
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_embedder_kind() -> EmbedderKind {
    EmbedderKind::Hashing
}

fn default_dimension() -> usize {
    384
}

fn default_memory_capacity() -> usize {
    1000
}

fn default_enhancement_ttl() -> u64 {
    3600
}

fn default_rerank_ttl() -> u64 {
    1800
}

fn default_response_ttl() -> u64 {
    1800
}

fn default_alpha() -> f32 {
    0.7
}

fn default_n_results() -> usize {
    15
}

fn default_dense_cap() -> usize {
    20
}

fn default_retrieval_weight() -> f32 {
    0.3
}

fn default_pairwise_weight() -> f32 {
    0.7
}

fn default_cache_prefix_chars() -> usize {
    50
}

fn default_threshold() -> f32 {
    0.7
}

fn default_provider() -> Provider {
    Provider::Mistral
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    512
}

fn default_timeout() -> u64 {
    30
}

fn default_stream_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    120
}

fn default_workers() -> usize {
    4
}

fn default_stream_buffer() -> usize {
    32
}

fn default_top_k() -> usize {
    3
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rag-pipeline")
        .join("corpus.db")
}

impl RagConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::RagError::Config {
                message: format!("Failed to parse config: {}", e),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> crate::error::Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rag-pipeline").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("rag-pipeline.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        // Return defaults
        Ok(Self::default())
    }

    /// Reject values that would make the scoring formulas meaningless.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            return Err(crate::error::RagError::config(format!(
                "retrieval.alpha must be within [0, 1], got {}",
                self.retrieval.alpha
            )));
        }
        if self.cache.memory_capacity == 0 {
            return Err(crate::error::RagError::config(
                "cache.memory_capacity must be at least 1",
            ));
        }
        for name in self.generation.providers.keys() {
            name.parse::<Provider>()?;
        }
        Ok(())
    }
}
