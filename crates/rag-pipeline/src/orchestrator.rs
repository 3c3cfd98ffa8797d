//! Query orchestration.
//!
//! Each request walks a fixed sequence of stages:
//!
//! ```text
//! predefined -> cache -> enhance -> retrieve -> rerank -> prompt -> generate -> cache write
//! ```
//!
//! A predefined match or a cached response ends the request early, and so
//! does an empty retrieval (with a fixed answer, without calling the
//! generation backend). Enhancement, retrieval, reranking and caching degrade
//! on failure; only generation and configuration errors reach the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use rag_cache::{TieredCache, NS_FULL_RESPONSE};
use rag_core::{
    BlockingPool, Embedder, GenerationParams, Generator, Provider, RagConfig, RagError, RankedItem,
    Result, RetrievedItem, VectorIndex,
};
use rag_llm::ProviderRegistry;
use rag_query::{dedup_by_content, scorer_from_config, HybridSearch, Reranker, SparseIndex};

use crate::enhancer::QueryEnhancer;
use crate::events::{EventStream, FinalMetadata, InitMetadata, StreamEvent};
use crate::predefined::{PredefinedMatch, PredefinedMatcher};
use crate::prompt::build_prompt;
use crate::response::{AnswerSource, QueryFailure, QueryRequest, QueryResponse, SourceRef};

/// Answer returned when neither retrieval path finds anything.
pub const NO_CONTEXT_ANSWER: &str = "Aucun document pertinent trouvé pour votre question.";

/// Tunables of one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_provider: Provider,
    pub default_top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Results requested from hybrid search per query variant.
    pub n_results: usize,
    pub alpha: f32,
    pub predefined_enabled: bool,
    pub enhancement_ttl: Duration,
    pub response_ttl: Duration,
    /// Overall budget of one request.
    pub deadline: Duration,
    pub stream_buffer: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            default_provider: config.generation.default_provider,
            default_top_k: config.pipeline.default_top_k,
            temperature: config.generation.temperature,
            max_tokens: config.generation.max_tokens,
            n_results: config.retrieval.n_results,
            alpha: config.retrieval.alpha,
            predefined_enabled: config.predefined.enabled,
            enhancement_ttl: Duration::from_secs(config.cache.enhancement_ttl_secs),
            response_ttl: Duration::from_secs(config.cache.response_ttl_secs),
            deadline: config.pipeline.request_timeout(),
            stream_buffer: config.pipeline.stream_buffer,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

/// Collaborators of a pipeline.
pub struct PipelineParts {
    pub matcher: PredefinedMatcher,
    pub search: HybridSearch,
    pub reranker: Reranker,
    pub generators: ProviderRegistry,
    pub cache: Arc<TieredCache>,
}

/// Turns questions into answers.
pub struct QueryPipeline {
    matcher: PredefinedMatcher,
    enhancer: QueryEnhancer,
    search: HybridSearch,
    reranker: Reranker,
    generators: ProviderRegistry,
    cache: Arc<TieredCache>,
    settings: PipelineSettings,
}

/// Per-request state shared by every stage.
struct Plan {
    id: String,
    question: String,
    provider: Provider,
    model: String,
    top_k: usize,
    params: GenerationParams,
    deadline: Deadline,
}

/// Outcome of every stage before generation.
enum Prepared {
    Predefined(PredefinedMatch),
    Cached(QueryResponse),
    NoContext {
        enhanced: Vec<String>,
        timings: Timings,
    },
    Context {
        generator: Arc<dyn Generator>,
        enhanced: Vec<String>,
        search_results: usize,
        ranked: Vec<RankedItem>,
        prompt: String,
        timings: Timings,
    },
}

impl QueryPipeline {
    pub fn new(parts: PipelineParts, settings: PipelineSettings) -> Self {
        let enhancer = QueryEnhancer::new(parts.cache.clone(), settings.enhancement_ttl);
        Self {
            matcher: parts.matcher,
            enhancer,
            search: parts.search,
            reranker: parts.reranker,
            generators: parts.generators,
            cache: parts.cache,
            settings,
        }
    }

    /// Assemble a pipeline from configuration around the given corpus.
    pub async fn from_config(
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        sparse: Arc<SparseIndex>,
        pool: BlockingPool,
    ) -> Result<Self> {
        let cache = Arc::new(TieredCache::connect(&config.cache).await);
        let scorer = scorer_from_config(&config.rerank, pool)?;
        let reranker = Reranker::new(scorer, cache.clone()).configure(
            &config.rerank,
            Duration::from_secs(config.cache.rerank_ttl_secs),
        );
        let search =
            HybridSearch::new(embedder, vectors, sparse).with_dense_cap(config.retrieval.dense_cap);

        let parts = PipelineParts {
            matcher: PredefinedMatcher::from_config(&config.predefined)?,
            search,
            reranker,
            generators: ProviderRegistry::from_config(&config.generation, config.pipeline.stream_buffer)?,
            cache,
        };
        Ok(Self::new(parts, PipelineSettings::from_config(config)))
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn matcher(&self) -> &PredefinedMatcher {
        &self.matcher
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Answer a question in one piece.
    pub async fn answer(&self, request: &QueryRequest) -> std::result::Result<QueryResponse, QueryFailure> {
        let plan = self.plan(request);
        match self.answer_planned(&plan).await {
            Ok(response) => {
                info!(
                    "Query {} answered from {} in {}ms",
                    response.id, response.answer_source, response.response_time_ms
                );
                Ok(response)
            }
            Err(e) => {
                error!("Query {} failed: {}", plan.id, e);
                Err(QueryFailure::new(
                    plan.id,
                    e,
                    plan.provider,
                    plan.model,
                    plan.deadline.started,
                ))
            }
        }
    }

    /// Answer a question as a stream of events.
    ///
    /// Dropping the returned stream stops the request, including an
    /// in-flight generation call.
    pub fn answer_stream(self: &Arc<Self>, request: QueryRequest) -> EventStream {
        let (tx, stream) = EventStream::channel(self.settings.stream_buffer);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let plan = pipeline.plan(&request);
            let mut emitter = Emitter { tx, init_sent: false };
            match pipeline.stream_planned(&plan, &mut emitter).await {
                Ok(()) => debug!("Stream {} completed", plan.id),
                Err(Halt::Cancelled) => debug!("Stream {} cancelled by consumer", plan.id),
                Err(Halt::Failed(e)) => {
                    error!("Stream {} failed: {}", plan.id, e);
                    emitter.fail(&pipeline.init_metadata(&plan, Vec::new()), e).await;
                }
            }
        });
        stream
    }

    fn plan(&self, request: &QueryRequest) -> Plan {
        let provider = request.provider.unwrap_or(self.settings.default_provider);
        let model = self
            .generators
            .get(provider)
            .map(|g| g.profile().model_name.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        Plan {
            id: Ulid::new().to_string(),
            question: request.question.trim().to_string(),
            provider,
            model,
            top_k: request.top_k.unwrap_or(self.settings.default_top_k),
            params: GenerationParams {
                temperature: request.temperature.unwrap_or(self.settings.temperature),
                max_tokens: request.max_tokens.unwrap_or(self.settings.max_tokens),
            },
            deadline: Deadline::new(self.settings.deadline),
        }
    }

    async fn answer_planned(&self, plan: &Plan) -> Result<QueryResponse> {
        match self.prepare(plan).await? {
            Prepared::Predefined(hit) => Ok(self.predefined_response(plan, hit)),
            Prepared::Cached(mut response) => {
                response.id = plan.id.clone();
                response.timestamp = now_rfc3339();
                response.answer_source = AnswerSource::Cache;
                response.response_time_ms = plan.deadline.elapsed_ms();
                Ok(response)
            }
            Prepared::NoContext { enhanced, timings } => {
                Ok(self.no_context_response(plan, enhanced, timings))
            }
            Prepared::Context {
                generator,
                enhanced,
                search_results,
                ranked,
                prompt,
                mut timings,
            } => {
                let stage = Instant::now();
                let answer = plan
                    .deadline
                    .run("generate", generator.generate(&prompt, &plan.params))
                    .await??;
                timings.record("generate", stage);

                if answer.trim().is_empty() {
                    return Err(RagError::http(format!(
                        "{} returned an empty answer",
                        plan.provider
                    )));
                }

                let response = QueryResponse {
                    id: plan.id.clone(),
                    answer,
                    context_found: true,
                    answer_source: AnswerSource::Generated,
                    provider_used: plan.provider.to_string(),
                    model_used: plan.model.clone(),
                    response_time_ms: plan.deadline.elapsed_ms(),
                    timestamp: now_rfc3339(),
                    search_results,
                    ranked_results: ranked.len(),
                    enhanced_queries: enhanced,
                    sources: SourceRef::from_ranked(&ranked),
                    confidence: None,
                    matched_question: None,
                    timings: timings.into_map(),
                };

                self.write_response(plan, &response).await;
                Ok(response)
            }
        }
    }

    async fn stream_planned(&self, plan: &Plan, emitter: &mut Emitter) -> std::result::Result<(), Halt> {
        match self.prepare(plan).await? {
            Prepared::Predefined(hit) => {
                emitter.send(StreamEvent::Init { metadata: self.init_metadata(plan, Vec::new()) }).await?;
                emitter.send(StreamEvent::Chunk { content: hit.rule.answer }).await?;
                emitter
                    .send(self.final_event(plan, 0, 0, true, AnswerSource::Predefined))
                    .await
            }
            Prepared::Cached(response) => {
                emitter
                    .send(StreamEvent::Init {
                        metadata: self.init_metadata(plan, response.enhanced_queries),
                    })
                    .await?;
                emitter.send(StreamEvent::Chunk { content: response.answer }).await?;
                emitter
                    .send(self.final_event(
                        plan,
                        response.search_results,
                        response.ranked_results,
                        response.context_found,
                        AnswerSource::Cache,
                    ))
                    .await
            }
            Prepared::NoContext { enhanced, .. } => {
                emitter.send(StreamEvent::Init { metadata: self.init_metadata(plan, enhanced) }).await?;
                emitter
                    .send(StreamEvent::Chunk {
                        content: NO_CONTEXT_ANSWER.to_string(),
                    })
                    .await?;
                emitter
                    .send(self.final_event(plan, 0, 0, false, AnswerSource::NoContext))
                    .await
            }
            Prepared::Context {
                generator,
                enhanced,
                search_results,
                ranked,
                prompt,
                ..
            } => {
                emitter.send(StreamEvent::Init { metadata: self.init_metadata(plan, enhanced) }).await?;

                let mut fragments = plan
                    .deadline
                    .run("generate", generator.generate_stream(&prompt, &plan.params))
                    .await??;

                let mut produced = false;
                loop {
                    let next = tokio::select! {
                        _ = emitter.tx.closed() => return Err(Halt::Cancelled),
                        next = plan.deadline.run("generate", fragments.next_fragment()) => next?,
                    };
                    match next {
                        Some(Ok(content)) if content.is_empty() => {}
                        Some(Ok(content)) => {
                            produced = true;
                            emitter.send(StreamEvent::Chunk { content }).await?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }

                if !produced {
                    return Err(RagError::malformed_stream("stream ended without answer text").into());
                }

                emitter
                    .send(self.final_event(plan, search_results, ranked.len(), true, AnswerSource::Generated))
                    .await
            }
        }
    }

    /// Every stage up to, and excluding, generation.
    async fn prepare(&self, plan: &Plan) -> Result<Prepared> {
        if plan.question.is_empty() {
            return Err(RagError::invalid_argument("question is empty"));
        }
        if plan.top_k == 0 {
            return Err(RagError::invalid_argument("top_k must be at least 1"));
        }

        let mut timings = Timings::default();

        if self.settings.predefined_enabled {
            let stage = Instant::now();
            let hit = self.matcher.find(&plan.question);
            timings.record("predefined", stage);
            if let Some(hit) = hit {
                return Ok(Prepared::Predefined(hit));
            }
        }

        let generator = self.generators.get(plan.provider)?;

        let key = response_key(&plan.question, plan.provider, plan.top_k);
        if let Some(cached) = self.cache.get_json::<QueryResponse>(NS_FULL_RESPONSE, &key).await {
            debug!("Full-response cache hit for {:?}", plan.question);
            return Ok(Prepared::Cached(cached));
        }

        let stage = Instant::now();
        let enhanced = plan
            .deadline
            .run("enhance", self.enhancer.enhance(&plan.question, generator.as_ref()))
            .await?;
        timings.record("enhance", stage);

        let stage = Instant::now();
        let retrieved = plan.deadline.run("retrieve", self.retrieve(&enhanced)).await?;
        timings.record("retrieve", stage);

        if retrieved.is_empty() {
            info!("No context found for {:?}", plan.question);
            return Ok(Prepared::NoContext { enhanced, timings });
        }

        let search_results = retrieved.len();
        let candidates = dedup_by_content(retrieved);

        let stage = Instant::now();
        let ranked = plan
            .deadline
            .run(
                "rerank",
                self.reranker.rerank(&plan.question, &candidates, plan.top_k),
            )
            .await?;
        timings.record("rerank", stage);

        let prompt = build_prompt(&plan.question, &ranked);

        debug!(
            "Query {}: {} variants, {} retrieved, {} candidates, {} ranked",
            plan.id,
            enhanced.len(),
            search_results,
            candidates.len(),
            ranked.len()
        );

        Ok(Prepared::Context {
            generator,
            enhanced,
            search_results,
            ranked,
            prompt,
            timings,
        })
    }

    /// Hybrid search for every variant, concatenated.
    async fn retrieve(&self, queries: &[String]) -> Vec<RetrievedItem> {
        let searches = queries
            .iter()
            .map(|q| self.search.search(q, self.settings.n_results, self.settings.alpha));
        let results = join_all(searches).await;

        let mut all = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(items) => all.extend(items),
                Err(e) => warn!("Retrieval failed for variant {:?}: {}", query, e),
            }
        }
        all
    }

    async fn write_response(&self, plan: &Plan, response: &QueryResponse) {
        let key = response_key(&plan.question, plan.provider, plan.top_k);
        if let Err(e) = self
            .cache
            .set_json(NS_FULL_RESPONSE, &key, response, self.settings.response_ttl)
            .await
        {
            warn!("Failed to cache response {}: {}", response.id, e);
        }
    }

    fn predefined_response(&self, plan: &Plan, hit: PredefinedMatch) -> QueryResponse {
        let mut timings = Timings::default();
        timings.0.insert("predefined".to_string(), plan.deadline.elapsed_ms());
        QueryResponse {
            id: plan.id.clone(),
            answer: hit.rule.answer,
            context_found: true,
            answer_source: AnswerSource::Predefined,
            provider_used: plan.provider.to_string(),
            model_used: plan.model.clone(),
            response_time_ms: plan.deadline.elapsed_ms(),
            timestamp: now_rfc3339(),
            search_results: 0,
            ranked_results: 0,
            enhanced_queries: Vec::new(),
            sources: Vec::new(),
            confidence: Some(hit.rule.confidence),
            matched_question: Some(hit.rule.canonical_question),
            timings: timings.into_map(),
        }
    }

    fn no_context_response(&self, plan: &Plan, enhanced: Vec<String>, timings: Timings) -> QueryResponse {
        QueryResponse {
            id: plan.id.clone(),
            answer: NO_CONTEXT_ANSWER.to_string(),
            context_found: false,
            answer_source: AnswerSource::NoContext,
            provider_used: plan.provider.to_string(),
            model_used: plan.model.clone(),
            response_time_ms: plan.deadline.elapsed_ms(),
            timestamp: now_rfc3339(),
            search_results: 0,
            ranked_results: 0,
            enhanced_queries: enhanced,
            sources: Vec::new(),
            confidence: None,
            matched_question: None,
            timings: timings.into_map(),
        }
    }

    fn init_metadata(&self, plan: &Plan, enhanced_queries: Vec<String>) -> InitMetadata {
        InitMetadata {
            id: plan.id.clone(),
            provider: plan.provider.to_string(),
            model: plan.model.clone(),
            enhanced_queries,
            timestamp: now_rfc3339(),
        }
    }

    fn final_event(
        &self,
        plan: &Plan,
        search_results: usize,
        ranked_results: usize,
        context_found: bool,
        answer_source: AnswerSource,
    ) -> StreamEvent {
        StreamEvent::Final {
            metadata: FinalMetadata {
                response_time_ms: plan.deadline.elapsed_ms(),
                search_results,
                ranked_results,
                context_found,
                answer_source,
            },
        }
    }
}

/// Key material of the full-response cache.
pub fn response_key(question: &str, provider: Provider, top_k: usize) -> String {
    format!("{}_{}_{}", question, provider, top_k)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Absolute deadline of one request.
struct Deadline {
    started: Instant,
    /// `None` when the budget is too large to represent as an instant.
    at: Option<tokio::time::Instant>,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: tokio::time::Instant::from_std(started).checked_add(budget),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn expired(&self, stage: &str) -> RagError {
        RagError::Timeout {
            stage: stage.to_string(),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Run `fut` unless the deadline has passed, aborting it when it does.
    async fn run<F: Future>(&self, stage: &str, fut: F) -> Result<F::Output> {
        let Some(at) = self.at else {
            return Ok(fut.await);
        };
        if tokio::time::Instant::now() >= at {
            return Err(self.expired(stage));
        }
        tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| self.expired(stage))
    }
}

#[derive(Default)]
struct Timings(BTreeMap<String, u64>);

impl Timings {
    fn record(&mut self, stage: &str, since: Instant) {
        let ms = since.elapsed().as_millis() as u64;
        debug!("Stage {} took {}ms", stage, ms);
        self.0.insert(stage.to_string(), ms);
    }

    fn into_map(self) -> BTreeMap<String, u64> {
        self.0
    }
}

/// Why a stream stopped early.
enum Halt {
    Cancelled,
    Failed(RagError),
}

impl From<RagError> for Halt {
    fn from(e: RagError) -> Self {
        Halt::Failed(e)
    }
}

struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    init_sent: bool,
}

impl Emitter {
    async fn send(&mut self, event: StreamEvent) -> std::result::Result<(), Halt> {
        if matches!(event, StreamEvent::Init { .. }) {
            self.init_sent = true;
        }
        self.tx.send(event).await.map_err(|_| Halt::Cancelled)
    }

    /// Terminate with an error event, opening the stream first if needed.
    async fn fail(&mut self, init: &InitMetadata, e: RagError) {
        if !self.init_sent {
            let _ = self
                .send(StreamEvent::Init {
                    metadata: init.clone(),
                })
                .await;
        }
        let _ = self
            .send(StreamEvent::Error {
                error: e.to_string(),
                error_code: e.error_code().to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unrepresentable_budget_runs_without_deadline() {
        let deadline = Deadline::new(Duration::MAX);
        assert!(deadline.at.is_none());
        assert_eq!(deadline.run("generate", async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_spent_budget_rejects_stage() {
        let deadline = Deadline::new(Duration::ZERO);
        let err = deadline.run("retrieve", async { 7 }).await.unwrap_err();
        assert!(matches!(err, RagError::Timeout { ref stage, .. } if stage == "retrieve"));
    }

    #[test]
    fn test_response_key_material() {
        assert_eq!(
            response_key("âge de la retraite", Provider::Mistral, 3),
            "âge de la retraite_mistral_3"
        );
        assert_ne!(
            response_key("q", Provider::Mistral, 3),
            response_key("q", Provider::Groq, 3)
        );
    }

    #[test]
    fn test_settings_follow_config() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.default_provider, Provider::Mistral);
        assert_eq!(settings.default_top_k, 3);
        assert_eq!(settings.n_results, 15);
        assert!((settings.alpha - 0.7).abs() < 1e-6);
        assert!((settings.temperature - 0.3).abs() < 1e-6);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.response_ttl, Duration::from_secs(1800));
        assert_eq!(settings.enhancement_ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_deadline_passes_fast_work() {
        let deadline = Deadline::new(Duration::from_secs(5));
        assert_eq!(deadline.run("retrieve", async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_deadline_aborts_slow_stage() {
        let deadline = Deadline::new(Duration::from_millis(20));
        let err = deadline
            .run("rerank", tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TIMEOUT");
        assert!(matches!(err, RagError::Timeout { ref stage, .. } if stage == "rerank"));
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_stage() {
        let deadline = Deadline::new(Duration::ZERO);
        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = deadline
            .run("retrieve", async { ran.store(true, std::sync::atomic::Ordering::SeqCst) })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout { .. }));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
