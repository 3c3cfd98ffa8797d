//! Request and response types of the query pipeline.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rag_core::{Metadata, Provider, RagError, RankedItem};

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Predefined,
    Cache,
    Generated,
    NoContext,
}

impl std::fmt::Display for AnswerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AnswerSource::Predefined => "predefined",
            AnswerSource::Cache => "cache",
            AnswerSource::Generated => "generated",
            AnswerSource::NoContext => "no_context",
        };
        f.write_str(name)
    }
}

/// A question to answer. Unset fields take pipeline defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,

    #[serde(default)]
    pub provider: Option<Provider>,

    #[serde(default)]
    pub top_k: Option<usize>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A context chunk cited by an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Label number used in the prompt (`Source N`).
    pub source_id: usize,
    pub score: f32,
    pub original_rank: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SourceRef {
    pub fn from_ranked(ranked: &[RankedItem]) -> Vec<Self> {
        ranked
            .iter()
            .enumerate()
            .map(|(i, item)| Self {
                source_id: i + 1,
                score: item.final_score,
                original_rank: item.original_rank,
                metadata: item.metadata.clone(),
            })
            .collect()
    }
}

/// A successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub answer: String,
    pub context_found: bool,
    pub answer_source: AnswerSource,
    pub provider_used: String,
    pub model_used: String,
    pub response_time_ms: u64,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Retrieved items across all query variants, before deduplication.
    pub search_results: usize,
    pub ranked_results: usize,
    #[serde(default)]
    pub enhanced_queries: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// Rule confidence, for predefined answers.
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub matched_question: Option<String>,
    /// Milliseconds spent per stage.
    #[serde(default)]
    pub timings: BTreeMap<String, u64>,
}

/// A failed query, as reported to the caller.
#[derive(Debug, Error, Serialize)]
#[error("{error_code}: {error}")]
pub struct QueryFailure {
    pub id: String,
    pub error: String,
    pub error_code: String,
    pub provider: String,
    pub model: String,
    pub elapsed_ms: u64,
    #[serde(skip)]
    #[source]
    pub cause: RagError,
}

impl QueryFailure {
    pub fn new(id: String, cause: RagError, provider: Provider, model: String, started: Instant) -> Self {
        Self {
            id,
            error: cause.to_string(),
            error_code: cause.error_code().to_string(),
            provider: provider.to_string(),
            model,
            elapsed_ms: started.elapsed().as_millis() as u64,
            cause,
        }
    }
}
