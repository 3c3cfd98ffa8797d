//! End-to-end pipeline scenarios over an in-memory corpus and scripted
//! generation backends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use rag_cache::TieredCache;
use rag_core::{
    BlockingPool, CorpusChunk, Embedder, GenerationParams, Generator, Provider, ProviderProfile,
    RagError, Result, TextStream,
};
use rag_embed::HashingEmbedder;
use rag_llm::ProviderRegistry;
use rag_pipeline::{
    AnswerSource, PipelineParts, PipelineSettings, PredefinedMatcher, QueryPipeline, QueryRequest,
    StreamEvent, NO_CONTEXT_ANSWER,
};
use rag_query::{HybridSearch, LexicalPairwiseScorer, Reranker, SparseIndex};
use rag_store::SqliteStore;

const ANSWER: &str = "L'âge légal de départ à la retraite est de 60 ans (Source 1).";

const CORPUS: &[&str] = &[
    "L'âge légal de départ à la retraite est fixé à 60 ans pour les salariés affiliés.",
    "Le taux de cotisation retraite est de 14% du salaire brut, dont 8,4% pour l'employeur.",
    "Les allocations familiales sont versées pour chaque enfant à charge de moins de 21 ans.",
    "La retraite anticipée est possible à partir de 55 ans sous conditions de cotisation.",
];

/// How the scripted backend streams.
#[derive(Clone)]
enum StreamMode {
    /// The answer, split on spaces.
    Words,
    /// One fragment, then an upstream error.
    FailAfterFirst,
    /// Fragments forever; flags `closed` once the consumer goes away.
    Endless,
}

struct ScriptedGenerator {
    profile: ProviderProfile,
    variants: String,
    fail_answers: bool,
    answer_delay: Duration,
    stream_mode: StreamMode,
    enhance_calls: AtomicUsize,
    answer_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    fn new() -> Self {
        Self {
            profile: ProviderProfile::builtin(Provider::Mistral),
            variants: "Âge de départ à la retraite\nÀ quel âge partir en retraite ?".to_string(),
            fail_answers: false,
            answer_delay: Duration::ZERO,
            stream_mode: StreamMode::Words,
            enhance_calls: AtomicUsize::new(0),
            answer_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn answers(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    fn enhancements(&self) -> usize {
        self.enhance_calls.load(Ordering::SeqCst)
    }

    fn streams(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

fn is_answer_prompt(prompt: &str) -> bool {
    prompt.contains("Source 1:")
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        if !is_answer_prompt(prompt) {
            self.enhance_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(self.variants.clone());
        }

        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        if !self.answer_delay.is_zero() {
            tokio::time::sleep(self.answer_delay).await;
        }
        if self.fail_answers {
            return Err(RagError::Upstream {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(ANSWER.to_string())
    }

    async fn generate_stream(&self, prompt: &str, _params: &GenerationParams) -> Result<TextStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());

        match self.stream_mode {
            StreamMode::Words => {
                let words: Vec<&str> = ANSWER.split_inclusive(' ').collect();
                Ok(TextStream::from_fragments(words))
            }
            StreamMode::FailAfterFirst => {
                let (tx, stream) = TextStream::channel(4);
                tx.send(Ok("L'âge ".to_string())).await.unwrap();
                tx.send(Err(RagError::Upstream {
                    status: 502,
                    body: "connection reset".to_string(),
                }))
                .await
                .unwrap();
                Ok(stream)
            }
            StreamMode::Endless => {
                let (tx, stream) = TextStream::channel(1);
                let closed = self.closed.clone();
                tokio::spawn(async move {
                    loop {
                        if tx.send(Ok("mot ".to_string())).await.is_err() {
                            closed.store(true, Ordering::SeqCst);
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
                Ok(stream)
            }
        }
    }
}

/// Embedder wrapper counting query embeddings.
struct CountingEmbedder {
    inner: HashingEmbedder,
    queries: AtomicUsize,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed_documents(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_query(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

struct Harness {
    pipeline: Arc<QueryPipeline>,
    generator: Arc<ScriptedGenerator>,
    embedder: Arc<CountingEmbedder>,
    cache: Arc<TieredCache>,
}

impl Harness {
    async fn build(corpus: &[&str], generator: ScriptedGenerator, settings: PipelineSettings) -> Self {
        let pool = BlockingPool::new(2);
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(128).unwrap(),
            queries: AtomicUsize::new(0),
        });

        let store = Arc::new(SqliteStore::open_memory().unwrap().with_pool(pool.clone()));
        for (i, text) in corpus.iter().enumerate() {
            let chunk = CorpusChunk {
                content: text.to_string(),
                metadata: Default::default(),
            };
            let embeddings = embedder.inner.embed_documents(&[*text]).await.unwrap();
            store
                .add_document(&format!("doc-{}.txt", i), text, &[chunk], &embeddings)
                .await
                .unwrap();
        }

        let sparse = Arc::new(SparseIndex::new(pool.clone()));
        sparse.rebuild(store.as_ref()).await.unwrap();

        let cache = Arc::new(TieredCache::new(100));
        let generator = Arc::new(generator);
        let parts = PipelineParts {
            matcher: PredefinedMatcher::with_defaults(),
            search: HybridSearch::new(embedder.clone(), store, sparse),
            reranker: Reranker::new(Arc::new(LexicalPairwiseScorer::new(pool)), cache.clone()),
            generators: ProviderRegistry::new().with(Provider::Mistral, generator.clone()),
            cache: cache.clone(),
        };

        Self {
            pipeline: Arc::new(QueryPipeline::new(parts, settings)),
            generator,
            embedder,
            cache,
        }
    }

    async fn new(corpus: &[&str]) -> Self {
        Self::build(corpus, ScriptedGenerator::new(), PipelineSettings::default()).await
    }

    fn retrievals(&self) -> usize {
        self.embedder.queries.load(Ordering::SeqCst)
    }

    async fn stream(&self, request: QueryRequest) -> Vec<StreamEvent> {
        self.pipeline.answer_stream(request).collect().await
    }
}

fn chunks(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn assert_well_formed(events: &[StreamEvent]) {
    assert!(matches!(events.first(), Some(StreamEvent::Init { .. })), "{:?}", events);
    assert!(events.last().map_or(false, StreamEvent::is_terminal), "{:?}", events);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(
        events.iter().filter(|e| matches!(e, StreamEvent::Init { .. })).count(),
        1
    );
}

#[tokio::test]
async fn test_greeting_short_circuits() {
    let h = Harness::new(CORPUS).await;

    let response = h.pipeline.answer(&QueryRequest::new("Bonjour")).await.unwrap();
    assert_eq!(response.answer_source, AnswerSource::Predefined);
    assert_eq!(response.answer, "Bonjour ! Comment puis-je vous aider aujourd'hui ?");
    assert!(response.confidence.unwrap() >= 0.9);
    assert_eq!(response.matched_question.as_deref(), Some("Bonjour"));

    assert_eq!(h.retrievals(), 0);
    assert_eq!(h.generator.enhancements() + h.generator.answers(), 0);
    assert_eq!(h.cache.stats().writes, 0);
}

#[tokio::test]
async fn test_empty_corpus_answers_without_generation() {
    let h = Harness::new(&[]).await;

    let response = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement"))
        .await
        .unwrap();
    assert_eq!(response.answer, NO_CONTEXT_ANSWER);
    assert!(!response.context_found);
    assert_eq!(response.answer_source, AnswerSource::NoContext);
    assert!(response.sources.is_empty());
    assert_eq!(response.enhanced_queries.len(), 3);
    assert_eq!(h.generator.answers(), 0);
}

#[tokio::test]
async fn test_repeated_question_hits_cache() {
    let h = Harness::new(CORPUS).await;
    let request = QueryRequest::new("age of retirement")
        .with_provider(Provider::Mistral)
        .with_top_k(3);

    let first = h.pipeline.answer(&request).await.unwrap();
    assert_eq!(first.answer_source, AnswerSource::Generated);
    assert_eq!(first.answer, ANSWER);
    assert_eq!(h.generator.answers(), 1);

    let retrievals = h.retrievals();
    let second = h.pipeline.answer(&request).await.unwrap();
    assert_eq!(second.answer_source, AnswerSource::Cache);
    assert_eq!(second.answer, first.answer);
    assert_ne!(second.id, first.id);
    assert!(second.timestamp >= first.timestamp);
    assert_eq!(second.sources, first.sources);
    assert!(second.response_time_ms < 1000);
    assert_eq!(h.generator.answers(), 1);
    assert_eq!(h.retrievals(), retrievals);
}

#[tokio::test]
async fn test_cache_key_includes_top_k_and_provider() {
    let h = Harness::new(CORPUS).await;

    h.pipeline
        .answer(&QueryRequest::new("age of retirement").with_top_k(3))
        .await
        .unwrap();
    let other = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement").with_top_k(2))
        .await
        .unwrap();
    assert_eq!(other.answer_source, AnswerSource::Generated);
    assert_eq!(other.sources.len(), 2);
    assert_eq!(h.generator.answers(), 2);

    // Enhancement is cached per question, across top_k.
    assert_eq!(h.generator.enhancements(), 1);
}

#[tokio::test]
async fn test_prompt_cites_unique_ranked_sources() {
    let h = Harness::new(CORPUS).await;

    let response = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement").with_top_k(10))
        .await
        .unwrap();

    // Three variants, each retrieving the whole four-chunk corpus.
    assert_eq!(response.enhanced_queries.len(), 3);
    assert_eq!(response.search_results, 12);
    assert_eq!(response.ranked_results, 4);

    let ids: Vec<usize> = response.sources.iter().map(|s| s.source_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    let scores: Vec<f32> = response.sources.iter().map(|s| s.score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));

    let prompt = h.generator.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("QUESTION: age of retirement"));
    for text in CORPUS {
        assert_eq!(prompt.matches(text).count(), 1, "{} cited once", text);
    }
    assert!(prompt.contains("Source 4:"));
    assert!(!prompt.contains("Source 5:"));

    for stage in ["enhance", "retrieve", "rerank", "generate"] {
        assert!(response.timings.contains_key(stage), "missing timing {}", stage);
    }
}

#[tokio::test]
async fn test_generation_failure_is_reported_and_not_cached() {
    let mut generator = ScriptedGenerator::new();
    generator.fail_answers = true;
    let h = Harness::build(CORPUS, generator, PipelineSettings::default()).await;
    let request = QueryRequest::new("age of retirement");

    let failure = h.pipeline.answer(&request).await.unwrap_err();
    assert_eq!(failure.error_code, "UPSTREAM_ERROR");
    assert_eq!(failure.provider, "mistral");
    assert_eq!(failure.model, "mistral-medium");
    assert!(failure.error.contains("500"));

    h.pipeline.answer(&request).await.unwrap_err();
    assert_eq!(h.generator.answers(), 2);
}

#[tokio::test]
async fn test_unconfigured_provider_is_config_error() {
    let h = Harness::new(CORPUS).await;

    let failure = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement").with_provider(Provider::Groq))
        .await
        .unwrap_err();
    assert_eq!(failure.error_code, "CONFIG_ERROR");
    assert_eq!(failure.model, "unknown");
    assert_eq!(h.retrievals(), 0);
}

#[tokio::test]
async fn test_empty_question_is_rejected() {
    let h = Harness::new(CORPUS).await;
    let failure = h.pipeline.answer(&QueryRequest::new("   ")).await.unwrap_err();
    assert_eq!(failure.error_code, "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_deadline_aborts_slow_generation() {
    let mut generator = ScriptedGenerator::new();
    generator.answer_delay = Duration::from_secs(10);
    let settings = PipelineSettings {
        deadline: Duration::from_millis(300),
        ..PipelineSettings::default()
    };
    let h = Harness::build(CORPUS, generator, settings).await;

    let failure = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement"))
        .await
        .unwrap_err();
    assert_eq!(failure.error_code, "TIMEOUT");
    assert!(failure.error.contains("generate"));
    assert!(failure.elapsed_ms < 5_000);
}

#[tokio::test]
async fn test_stream_matches_single_shot() {
    let h = Harness::new(CORPUS).await;

    let events = h.stream(QueryRequest::new("age of retirement")).await;
    assert_well_formed(&events);
    assert_eq!(chunks(&events), ANSWER);

    match &events[0] {
        StreamEvent::Init { metadata } => {
            assert_eq!(metadata.provider, "mistral");
            assert_eq!(metadata.model, "mistral-medium");
            assert_eq!(metadata.enhanced_queries.len(), 3);
        }
        other => panic!("unexpected first event {:?}", other),
    }
    match events.last() {
        Some(StreamEvent::Final { metadata }) => {
            assert_eq!(metadata.answer_source, AnswerSource::Generated);
            assert!(metadata.context_found);
            assert_eq!(metadata.ranked_results, 3);
        }
        other => panic!("unexpected last event {:?}", other),
    }

    // Streaming does not populate the response cache.
    let response = h
        .pipeline
        .answer(&QueryRequest::new("age of retirement"))
        .await
        .unwrap();
    assert_eq!(response.answer_source, AnswerSource::Generated);
    assert_eq!(response.answer, chunks(&events));
    assert_eq!(h.generator.streams(), 1);
    assert_eq!(h.generator.answers(), 1);
}

#[tokio::test]
async fn test_stream_predefined_and_cached_answers() {
    let h = Harness::new(CORPUS).await;

    let events = h.stream(QueryRequest::new("Merci")).await;
    assert_well_formed(&events);
    assert_eq!(events.len(), 3);
    assert_eq!(chunks(&events), "De rien ! N'hésitez pas à me poser d'autres questions.");
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Final { metadata }) if metadata.answer_source == AnswerSource::Predefined
    ));

    h.pipeline
        .answer(&QueryRequest::new("age of retirement"))
        .await
        .unwrap();
    let events = h.stream(QueryRequest::new("age of retirement")).await;
    assert_well_formed(&events);
    assert_eq!(events.len(), 3);
    assert_eq!(chunks(&events), ANSWER);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Final { metadata }) if metadata.answer_source == AnswerSource::Cache
    ));
    assert_eq!(h.generator.streams(), 0);
}

#[tokio::test]
async fn test_stream_without_context() {
    let h = Harness::new(&[]).await;

    let events = h.stream(QueryRequest::new("age of retirement")).await;
    assert_well_formed(&events);
    assert_eq!(chunks(&events), NO_CONTEXT_ANSWER);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Final { metadata }) if !metadata.context_found
            && metadata.answer_source == AnswerSource::NoContext
    ));
    assert_eq!(h.generator.streams(), 0);
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_event() {
    let mut generator = ScriptedGenerator::new();
    generator.stream_mode = StreamMode::FailAfterFirst;
    let h = Harness::build(CORPUS, generator, PipelineSettings::default()).await;

    let events = h.stream(QueryRequest::new("age of retirement")).await;
    assert_well_formed(&events);
    assert_eq!(chunks(&events), "L'âge ");
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { error_code, .. }) if error_code == "UPSTREAM_ERROR"
    ));
}

#[tokio::test]
async fn test_stream_rejects_empty_question() {
    let h = Harness::new(CORPUS).await;

    let events = h.stream(QueryRequest::new("")).await;
    assert_well_formed(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        StreamEvent::Error { error_code, .. } if error_code == "INVALID_ARGUMENT"
    ));
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let mut generator = ScriptedGenerator::new();
    generator.stream_mode = StreamMode::Endless;
    let h = Harness::build(CORPUS, generator, PipelineSettings::default()).await;

    let mut stream = h.pipeline.answer_stream(QueryRequest::new("age of retirement"));
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Init { .. })));
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Chunk { .. })));
    drop(stream);

    let closed = h.generator.closed.clone();
    tokio::time::timeout(Duration::from_secs(2), async move {
        while !closed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("generation kept running after the consumer went away");
}

#[tokio::test]
async fn test_concurrent_requests_share_cache() {
    let h = Harness::new(CORPUS).await;

    let questions = ["age of retirement", "employer contribution rate", "family benefits for children"];
    let requests: Vec<QueryRequest> = questions.iter().map(|q| QueryRequest::new(*q)).collect();
    let answers = futures::future::join_all(requests.iter().map(|r| h.pipeline.answer(r))).await;
    assert!(answers.iter().all(|a| a.is_ok()));
    assert_eq!(h.generator.answers(), 3);

    for q in questions {
        let again = h.pipeline.answer(&QueryRequest::new(q)).await.unwrap();
        assert_eq!(again.answer_source, AnswerSource::Cache);
    }
    assert_eq!(h.generator.answers(), 3);
}
