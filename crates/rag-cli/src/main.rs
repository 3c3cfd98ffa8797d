//! rag - command-line front end of the query pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rag_cache::{TieredCache, NS_FULL_RESPONSE, NS_RERANK};
use rag_core::{BlockingPool, CorpusChunk, Embedder, Metadata, Provider, RagConfig};
use rag_pipeline::{PredefinedMatcher, QueryPipeline, QueryRequest, StreamEvent};
use rag_query::SparseIndex;
use rag_store::SqliteStore;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// rag - answer questions from a local document corpus
#[derive(Parser)]
#[command(name = "rag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir, then ./rag-pipeline.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question
    Ask {
        question: String,

        /// Print server-sent events as the answer is generated
        #[arg(short, long)]
        stream: bool,

        /// Generation provider (mistral, openai, anthropic, deepseek, groq)
        #[arg(short, long)]
        provider: Option<String>,

        /// Context chunks passed to the model
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Add text files to the corpus, one chunk per file
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Delete a document by id
    Delete { id: String },

    /// List stored documents
    List {
        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show corpus statistics
    Stats,

    /// Inspect predefined answers
    Predefined {
        #[command(subcommand)]
        action: PredefinedAction,
    },

    /// Manage the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum PredefinedAction {
    /// List canonical questions
    List,

    /// Show the rule a question would match
    Match {
        question: String,

        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Show rule table statistics
    Stats,

    /// Find rules by keyword
    Search { keyword: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached entry
    Clear,

    /// Show cache counters for this process
    Stats,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> CliResult<RagConfig> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::load(path)?,
        None => RagConfig::load_default()?,
    };
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    Ok(config)
}

fn open_store(config: &RagConfig, pool: &BlockingPool) -> CliResult<Arc<SqliteStore>> {
    debug!("Opening corpus at {}", config.database.path.display());
    Ok(Arc::new(
        SqliteStore::open(&config.database.path)?.with_pool(pool.clone()),
    ))
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let pool = BlockingPool::new(config.pipeline.workers);

    match cli.command {
        Commands::Ask {
            question,
            stream,
            provider,
            top_k,
            temperature,
            max_tokens,
        } => {
            let mut request = QueryRequest::new(question);
            request.provider = provider.map(|p| p.parse::<Provider>()).transpose()?;
            request.top_k = top_k;
            request.temperature = temperature;
            request.max_tokens = max_tokens;

            let pipeline = build_pipeline(&config, pool).await?;
            if stream {
                ask_stream(&pipeline, request).await?;
            } else {
                ask(&pipeline, &request).await?;
            }
        }
        Commands::Add { paths } => {
            let store = open_store(&config, &pool)?;
            add(&config, &store, &paths).await?;
        }
        Commands::Delete { id } => {
            let store = open_store(&config, &pool)?;
            let id = id.parse::<ulid::Ulid>().map_err(|e| format!("Invalid document id {}: {}", id, e))?;
            store.delete_document(id).await?;
            invalidate_answers(&config).await;
            println!("Deleted document {}", id);
        }
        Commands::List { limit, offset } => {
            let store = open_store(&config, &pool)?;
            let documents = store.list_documents(limit, offset).await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for doc in documents {
                println!("{}  {:>4} chunk(s)  {}", doc.id, doc.chunk_count, doc.source_uri);
            }
        }
        Commands::Stats => {
            let store = open_store(&config, &pool)?;
            println!("{}", serde_json::to_string_pretty(&store.stats().await?)?);
        }
        Commands::Predefined { action } => {
            let matcher = PredefinedMatcher::from_config(&config.predefined)?;
            predefined(&matcher, action)?;
        }
        Commands::Cache { action } => {
            let cache = TieredCache::connect(&config.cache).await;
            match action {
                CacheAction::Clear => {
                    let removed = cache.clear().await;
                    println!("Removed {} shared cache entries", removed);
                }
                CacheAction::Stats => {
                    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
                }
            }
        }
    }

    Ok(())
}

async fn build_pipeline(config: &RagConfig, pool: BlockingPool) -> CliResult<Arc<QueryPipeline>> {
    let store = open_store(config, &pool)?;
    let embedder = rag_embed::from_config(&config.embedding)?;

    let sparse = Arc::new(SparseIndex::new(pool.clone()));
    let indexed = sparse.rebuild(store.as_ref()).await?;
    debug!("Sparse index built over {} chunks", indexed);

    let pipeline = QueryPipeline::from_config(config, embedder, store, sparse, pool).await?;
    Ok(Arc::new(pipeline))
}

async fn ask(pipeline: &QueryPipeline, request: &QueryRequest) -> CliResult<()> {
    match pipeline.answer(request).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(failure) => {
            eprintln!("{}", serde_json::to_string_pretty(&failure)?);
            std::process::exit(1);
        }
    }
}

async fn ask_stream(pipeline: &Arc<QueryPipeline>, request: QueryRequest) -> CliResult<()> {
    let mut events = pipeline.answer_stream(request);
    let mut failed = false;
    while let Some(event) = events.next_event().await {
        failed |= matches!(event, StreamEvent::Error { .. });
        print!("{}", event.to_sse()?);
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn add(config: &RagConfig, store: &SqliteStore, paths: &[PathBuf]) -> CliResult<()> {
    let embedder = rag_embed::from_config(&config.embedding)?;

    let mut added = 0;
    let mut skipped = 0;
    let mut failed = 0;

    for path in paths {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("  Error reading {}: {}", path.display(), e);
                failed += 1;
                continue;
            }
        };
        if content.trim().is_empty() {
            eprintln!("  {} - empty, skipped", path.display());
            skipped += 1;
            continue;
        }

        let source_uri = source_uri(path)?;
        let hash = blake3::hash(content.as_bytes()).to_hex().to_string();
        if let Some(existing) = store.get_document_by_uri(&source_uri).await? {
            if existing.content_hash == hash {
                println!("  {} - unchanged", path.display());
                skipped += 1;
                continue;
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), source_uri.clone().into());
        let chunk = CorpusChunk {
            content: content.trim().to_string(),
            metadata,
        };

        let result = async {
            let embeddings = embedder.embed_documents(&[chunk.content.as_str()]).await?;
            store
                .add_document(&source_uri, &content, std::slice::from_ref(&chunk), &embeddings)
                .await
        }
        .await;

        match result {
            Ok(doc) => {
                println!("  {} - {}", path.display(), doc.id);
                added += 1;
            }
            Err(e) => {
                eprintln!("  {} - Error: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    if added > 0 {
        invalidate_answers(config).await;
    }

    println!(
        "\nComplete: {} added, {} skipped, {} failed",
        added, skipped, failed
    );
    Ok(())
}

fn source_uri(path: &Path) -> CliResult<String> {
    Ok(format!("file://{}", path.canonicalize()?.display()))
}

/// Drop cached answers and rankings that may cite a changed corpus.
async fn invalidate_answers(config: &RagConfig) {
    let cache = TieredCache::connect(&config.cache).await;
    let mut removed = 0;
    for namespace in [NS_FULL_RESPONSE, NS_RERANK] {
        removed += cache.invalidate_namespace(namespace).await;
    }
    info!("Invalidated {} cached entries after corpus change", removed);
}

fn predefined(matcher: &PredefinedMatcher, action: PredefinedAction) -> CliResult<()> {
    match action {
        PredefinedAction::List => {
            for question in matcher.questions() {
                println!("{}", question);
            }
        }
        PredefinedAction::Match { question, threshold } => {
            let threshold = threshold.unwrap_or_else(|| matcher.threshold());
            match matcher.find_with_threshold(&question, threshold) {
                Some(hit) => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "matched_question": hit.rule.canonical_question,
                        "answer": hit.rule.answer,
                        "score": hit.score,
                        "confidence": hit.rule.confidence,
                    }))?
                ),
                None => {
                    println!("No predefined answer above {:.2}", threshold);
                }
            }
        }
        PredefinedAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&matcher.statistics())?);
        }
        PredefinedAction::Search { keyword } => {
            let rules = matcher.search_by_keyword(&keyword);
            if rules.is_empty() {
                println!("No rules mention {:?}", keyword);
            }
            for rule in rules {
                println!("{}\n  {}", rule.canonical_question, rule.answer);
            }
        }
    }
    Ok(())
}
