//! Query enhancement through paraphrase generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use rag_cache::{TieredCache, NS_QUERY_ENHANCEMENT};
use rag_core::{GenerationParams, Generator};

/// Shortest paraphrase kept, in characters.
const MIN_VARIANT_CHARS: usize = 10;

/// Paraphrases kept per question.
const MAX_VARIANTS: usize = 2;

/// Widens retrieval recall with generated reformulations.
///
/// Failures never propagate: the original question alone is returned.
pub struct QueryEnhancer {
    cache: Arc<TieredCache>,
    ttl: Duration,
    params: GenerationParams,
}

impl QueryEnhancer {
    pub fn new(cache: Arc<TieredCache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            params: GenerationParams::default(),
        }
    }

    /// 1 to 3 queries, the first always equal to `question`.
    pub async fn enhance(&self, question: &str, generator: &dyn Generator) -> Vec<String> {
        if let Some(cached) = self
            .cache
            .get_json::<Vec<String>>(NS_QUERY_ENHANCEMENT, question)
            .await
        {
            debug!("Enhancement cache hit for {:?}", question);
            return cached;
        }

        let start = Instant::now();
        let reply = match generator.generate(&enhancement_prompt(question), &self.params).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Query enhancement failed, using the original question: {}", e);
                return vec![question.to_string()];
            }
        };

        let mut queries = Vec::with_capacity(MAX_VARIANTS + 1);
        queries.push(question.to_string());
        queries.extend(parse_variants(&reply));

        debug!(
            "Enhanced {:?} into {} queries in {}ms",
            question,
            queries.len(),
            start.elapsed().as_millis()
        );

        if let Err(e) = self
            .cache
            .set_json(NS_QUERY_ENHANCEMENT, question, &queries, self.ttl)
            .await
        {
            warn!("Failed to cache enhanced queries: {}", e);
        }

        queries
    }
}

/// Non-blank lines of at least [`MIN_VARIANT_CHARS`], at most [`MAX_VARIANTS`].
pub fn parse_variants(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|line| line.chars().count() >= MIN_VARIANT_CHARS)
        .take(MAX_VARIANTS)
        .map(str::to_string)
        .collect()
}

fn enhancement_prompt(question: &str) -> String {
    format!(
        "Vous reformulez des requêtes pour améliorer une recherche documentaire.\n\
         \n\
         Requête originale : \"{question}\"\n\
         \n\
         Proposez exactement 2 variantes de cette requête qui utilisent des synonymes \
         ou des termes alternatifs, ou abordent la question sous un autre angle.\n\
         \n\
         Répondez uniquement avec les 2 variantes, une par ligne, sans numérotation ni mise en forme :"
    )
}
