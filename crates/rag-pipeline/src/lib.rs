//! rag-pipeline - Query orchestration
//!
//! Turns a question into an answer, in one piece or as a stream of events:
//!
//! 1. [`PredefinedMatcher`] short-circuits greetings and frequent questions
//! 2. the full-response cache returns previous answers
//! 3. [`QueryEnhancer`] adds up to two paraphrases
//! 4. hybrid search runs for every variant, results are concatenated and
//!    de-duplicated
//! 5. the reranker keeps the best `top_k`
//! 6. the prompt cites them as `Source 1..N` and a generation backend answers
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_pipeline::{QueryPipeline, QueryRequest};
//!
//! let pipeline = QueryPipeline::from_config(&config, embedder, store, sparse, pool).await?;
//! let response = pipeline.answer(&QueryRequest::new("Quel est l'âge de la retraite ?")).await?;
//! println!("{}", response.answer);
//! ```

mod enhancer;
mod events;
mod orchestrator;
mod predefined;
mod prompt;
mod response;

pub use enhancer::{parse_variants, QueryEnhancer};
pub use events::{EventStream, FinalMetadata, InitMetadata, StreamEvent};
pub use orchestrator::{response_key, PipelineParts, PipelineSettings, QueryPipeline, NO_CONTEXT_ANSWER};
pub use predefined::{
    default_rules, default_synonyms, similarity, PredefinedMatch, PredefinedMatcher, PredefinedStats, Synonym,
    DEFAULT_THRESHOLD,
};
pub use prompt::{build_prompt, format_context};
pub use response::{AnswerSource, QueryFailure, QueryRequest, QueryResponse, SourceRef};
