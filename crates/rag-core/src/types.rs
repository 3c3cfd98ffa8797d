//! Core domain types for the query pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::RagError;

/// Free-form metadata attached to chunks and results.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Full-content fingerprint used for deduplication.
pub fn content_fingerprint(content: &str) -> [u8; 32] {
    *blake3::hash(content.as_bytes()).as_bytes()
}

/// Which retrieval path produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Dense,
    Sparse,
}

/// A retrieval hit, already scaled by its path weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Chunk text.
    pub content: String,

    /// Scaled retrieval score (higher is better).
    pub score: f32,

    /// Chunk metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Producing path.
    pub origin: Origin,
}

impl RetrievedItem {
    pub fn new(content: impl Into<String>, score: f32, metadata: Metadata, origin: Origin) -> Self {
        Self {
            content: content.into(),
            score,
            metadata,
            origin,
        }
    }

    /// Fingerprint of the full content.
    pub fn fingerprint(&self) -> [u8; 32] {
        content_fingerprint(&self.content)
    }
}

/// A reranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    /// Chunk text.
    pub content: String,

    /// Combined relevance score.
    pub final_score: f32,

    /// Chunk metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Position of the item in the reranker input (0-based).
    pub original_rank: usize,
}

/// A canned question/answer pair that bypasses retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredefinedRule {
    pub canonical_question: String,
    pub answer: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_rule_confidence")]
    pub confidence: f32,
}

fn default_rule_confidence() -> f32 {
    0.8
}

impl PredefinedRule {
    pub fn new(
        canonical_question: impl Into<String>,
        answer: impl Into<String>,
        keywords: &[&str],
        confidence: f32,
    ) -> Self {
        Self {
            canonical_question: canonical_question.into(),
            answer: answer.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            confidence,
        }
    }
}

/// Supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mistral,
    OpenAi,
    Anthropic,
    DeepSeek,
    Groq,
}

impl Provider {
    /// Every provider, in table order.
    pub const ALL: [Provider; 5] = [
        Provider::Mistral,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::DeepSeek,
        Provider::Groq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mistral => "mistral",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
        }
    }

    /// Environment variable holding the API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Mistral => "MISTRAL_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::Groq => "GROQ_API_KEY",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Provider {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mistral" => Ok(Self::Mistral),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "deepseek" => Ok(Self::DeepSeek),
            "groq" => Ok(Self::Groq),
            other => Err(RagError::config(format!("Unknown provider: {}", other))),
        }
    }
}

/// JSON dialect spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `messages` list, `choices[0].message.content`, `[DONE]` sentinel.
    ChatCompletions,
    /// Anthropic messages API with typed stream events.
    AnthropicMessages,
}

/// Static description of one generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub endpoint_url: String,
    pub model_name: String,
    pub auth_header_name: String,
    /// Scheme prefixed to the key (`Bearer`), or none for raw keys.
    pub auth_scheme: Option<String>,
    pub request_shape: WireFormat,
    pub response_shape: WireFormat,
    /// Additional fixed headers (API versioning).
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderProfile {
    /// Built-in profile for a provider.
    pub fn builtin(provider: Provider) -> Self {
        let (endpoint_url, model_name) = match provider {
            Provider::Mistral => ("https://api.mistral.ai/v1/chat/completions", "mistral-medium"),
            Provider::OpenAi => ("https://api.openai.com/v1/chat/completions", "gpt-4o-mini"),
            Provider::Anthropic => (
                "https://api.anthropic.com/v1/messages",
                "claude-3-haiku-20240307",
            ),
            Provider::DeepSeek => ("https://api.deepseek.com/v1/chat/completions", "deepseek-chat"),
            Provider::Groq => (
                "https://api.groq.com/openai/v1/chat/completions",
                "mixtral-8x7b-32768",
            ),
        };

        match provider {
            Provider::Anthropic => Self {
                provider,
                endpoint_url: endpoint_url.to_string(),
                model_name: model_name.to_string(),
                auth_header_name: "x-api-key".to_string(),
                auth_scheme: None,
                request_shape: WireFormat::AnthropicMessages,
                response_shape: WireFormat::AnthropicMessages,
                extra_headers: vec![("anthropic-version".to_string(), "2023-06-01".to_string())],
            },
            _ => Self {
                provider,
                endpoint_url: endpoint_url.to_string(),
                model_name: model_name.to_string(),
                auth_header_name: "Authorization".to_string(),
                auth_scheme: Some("Bearer".to_string()),
                request_shape: WireFormat::ChatCompletions,
                response_shape: WireFormat::ChatCompletions,
                extra_headers: Vec::new(),
            },
        }
    }

    /// Render the authentication header value for a key.
    pub fn auth_value(&self, api_key: &str) -> String {
        match self.auth_scheme.as_deref() {
            Some(scheme) if !scheme.is_empty() => format!("{} {}", scheme, api_key),
            _ => api_key.to_string(),
        }
    }
}

/// Sampling parameters shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

/// A nearest-neighbour hit from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub content: String,
    pub metadata: Metadata,
    /// Distance to the query (lower is closer).
    pub distance: f32,
}

/// One indexable unit of the corpus, as seen by the sparse index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusChunk {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A stored source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Where the content came from.
    pub source_uri: String,

    /// Blake3 hash of the raw content.
    pub content_hash: String,

    /// Number of chunks stored for this document.
    pub chunk_count: u32,

    /// Creation timestamp (Unix millis).
    pub created_at: u64,
}

/// A stored chunk of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Ulid,
    pub doc_id: Ulid,
    pub chunk_index: u32,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(doc_id: Ulid, chunk_index: u32, content: &str, metadata: Metadata) -> Self {
        Self {
            id: Ulid::new(),
            doc_id,
            chunk_index,
            content: content.to_string(),
            metadata,
        }
    }
}

/// Statistics about the corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub storage_bytes: u64,
}
