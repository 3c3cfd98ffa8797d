//! Pairwise relevance scorers used by the reranker.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use rag_core::{BlockingPool, PairwiseScorer, RagError, Result};

/// Local scorer: F1 of word overlap between query and candidate.
///
/// Runs on the blocking pool since it tokenizes every candidate.
pub struct LexicalPairwiseScorer {
    pool: BlockingPool,
}

impl LexicalPairwiseScorer {
    pub fn new(pool: BlockingPool) -> Self {
        Self { pool }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn overlap_f1(query: &HashSet<String>, candidate: &str) -> f32 {
    let candidate = words(candidate);
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(&candidate).count() as f32;
    if shared == 0.0 {
        return 0.0;
    }
    let precision = shared / candidate.len() as f32;
    let recall = shared / query.len() as f32;
    2.0 * precision * recall / (precision + recall)
}

#[async_trait]
impl PairwiseScorer for LexicalPairwiseScorer {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let query = words(query);
        let candidates = candidates.to_vec();
        self.pool
            .run(move || candidates.iter().map(|c| overlap_f1(&query, c)).collect())
            .await
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

/// Cross-encoder served over HTTP (text-embeddings-inference `/rerank`).
pub struct HttpCrossEncoder {
    client: Client,
    endpoint: String,
}

impl HttpCrossEncoder {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RagError::rerank(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PairwiseScorer for HttpCrossEncoder {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&RerankRequest {
                query,
                texts: candidates,
                raw_scores: false,
            })
            .send()
            .await
            .map_err(|e| RagError::rerank(format!("Cross-encoder request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::rerank(format!(
                "Cross-encoder returned {}: {}",
                status, body
            )));
        }

        let results: Vec<RerankScore> = response
            .json()
            .await
            .map_err(|e| RagError::rerank(format!("Invalid cross-encoder response: {}", e)))?;

        let mut scores: Vec<Option<f32>> = vec![None; candidates.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = Some(result.score);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| RagError::rerank(format!("No score for candidate {}", i))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Drain the request (headers plus `content-length` body) before replying.
    async fn drain_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    async fn serve_once(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            drain_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/rerank", addr)
    }

    #[tokio::test]
    async fn test_lexical_overlap_orders_candidates() {
        let scorer = LexicalPairwiseScorer::new(BlockingPool::new(1));
        let candidates = vec![
            "Le congé parental dure trois ans.".to_string(),
            "L'âge de la retraite est 62 ans.".to_string(),
            "".to_string(),
        ];
        let scores = scorer.score("âge de la retraite", &candidates).await.unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_overlap_f1_identical_is_one() {
        let query = words("taux de cotisation");
        assert!((overlap_f1(&query, "Taux de cotisation") - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cross_encoder_maps_by_index() {
        let url = serve_once(r#"[{"index":1,"score":0.9},{"index":0,"score":0.2}]"#.to_string()).await;
        let scorer = HttpCrossEncoder::new(url).unwrap();
        let scores = scorer
            .score("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[tokio::test]
    async fn test_cross_encoder_missing_index_is_error() {
        let url = serve_once(r#"[{"index":0,"score":0.2}]"#.to_string()).await;
        let scorer = HttpCrossEncoder::new(url).unwrap();
        let err = scorer
            .score("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RERANK_ERROR");
    }
}
