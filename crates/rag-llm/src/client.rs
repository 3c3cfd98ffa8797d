//! HTTP generation client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rag_core::{
    GenerationParams, Generator, ProviderProfile, RagError, Result, TextStream, WireFormat,
};

use crate::sse::{classify, LineDecoder, SseLine};
use crate::wire::{extract_delta, extract_text, request_body, StreamDelta};

/// Default fragment buffer between the network task and the consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// One generation backend reached over HTTPS.
///
/// A missing API key is reported when a call is made, not at construction,
/// so every provider can be registered up front.
pub struct LlmClient {
    client: Client,
    profile: ProviderProfile,
    api_key: Option<String>,
    timeout: Duration,
    stream_timeout: Duration,
    stream_buffer: usize,
}

impl LlmClient {
    pub fn new(profile: ProviderProfile, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| RagError::http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            profile,
            api_key,
            timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(60),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        })
    }

    /// Set the single-shot and streaming timeouts.
    pub fn with_timeouts(mut self, timeout: Duration, stream_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.stream_timeout = stream_timeout;
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    /// Send the request and fail on missing credentials or non-2xx status.
    async fn send(
        &self,
        prompt: &str,
        params: &GenerationParams,
        stream: bool,
        timeout: Duration,
    ) -> Result<Response> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RagError::MissingCredential {
                provider: self.profile.provider.to_string(),
            })?;

        let body = request_body(&self.profile, prompt, params, stream);
        let mut request = self
            .client
            .post(&self.profile.endpoint_url)
            .timeout(timeout)
            .header(
                self.profile.auth_header_name.as_str(),
                self.profile.auth_value(api_key),
            )
            .json(&body);
        for (name, value) in &self.profile.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, "generation", started))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "{} returned {}: {}",
                self.profile.provider,
                status,
                truncate(&body, 200)
            );
            return Err(RagError::Upstream { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl Generator for LlmClient {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let started = Instant::now();
        let response = self.send(prompt, params, false, self.timeout).await?;

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, "generation", started))?;

        let text = extract_text(self.profile.response_shape, &envelope).ok_or_else(|| {
            RagError::http(format!(
                "{} response has no answer text",
                self.profile.provider
            ))
        })?;

        info!(
            "{} generated {} chars in {}ms",
            self.profile.provider,
            text.len(),
            started.elapsed().as_millis()
        );
        Ok(text)
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        let response = self.send(prompt, params, true, self.stream_timeout).await?;

        let (tx, stream) = TextStream::channel(self.stream_buffer);
        let format = self.profile.response_shape;
        let provider = self.profile.provider;
        tokio::spawn(async move {
            pump(response, tx, format).await;
            debug!("{} stream task finished", provider);
        });

        Ok(stream)
    }
}

enum Step {
    Continue,
    Finished,
}

/// Per-stream decoding state.
struct StreamState {
    format: WireFormat,
    decoder: LineDecoder,
    valid_frames: usize,
    skipped: usize,
}

impl StreamState {
    /// Handle one line; returns a fragment to forward, if any.
    fn line(&mut self, line: &str) -> (Option<String>, Step) {
        match classify(line) {
            SseLine::Ignored => (None, Step::Continue),
            SseLine::Done => {
                self.valid_frames += 1;
                (None, Step::Finished)
            }
            SseLine::Data(payload) => match serde_json::from_str::<Value>(payload) {
                Ok(value) => {
                    self.valid_frames += 1;
                    match extract_delta(self.format, &value) {
                        StreamDelta::Text(text) => (Some(text), Step::Continue),
                        StreamDelta::Stop => (None, Step::Finished),
                        StreamDelta::Empty => (None, Step::Continue),
                    }
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping malformed stream frame: {}", e);
                    (None, Step::Continue)
                }
            },
        }
    }
}

/// Forward fragments from the response body until the stream ends, fails,
/// or the consumer goes away. Dropping `response` closes the connection.
async fn pump(response: Response, tx: mpsc::Sender<Result<String>>, format: WireFormat) {
    let started = Instant::now();
    let body = response.bytes_stream();
    tokio::pin!(body);
    let mut state = StreamState {
        format,
        decoder: LineDecoder::default(),
        valid_frames: 0,
        skipped: 0,
    };

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("Stream consumer went away, closing upstream");
                return;
            }
            next = body.next() => next,
        };

        let lines = match next {
            Some(Ok(bytes)) => state.decoder.push(&bytes),
            Some(Err(e)) => {
                let _ = tx.send(Err(transport_error(e, "streaming", started))).await;
                return;
            }
            None => {
                let rest = state.decoder.finish();
                let mut finished = false;
                for line in rest.iter() {
                    let (fragment, step) = state.line(line);
                    if let Some(text) = fragment {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    finished = matches!(step, Step::Finished);
                }
                if !finished && state.valid_frames == 0 {
                    let _ = tx
                        .send(Err(RagError::malformed_stream(format!(
                            "stream ended without a decodable frame ({} skipped)",
                            state.skipped
                        ))))
                        .await;
                }
                return;
            }
        };

        for line in lines {
            let (fragment, step) = state.line(&line);
            if let Some(text) = fragment {
                if tx.send(Ok(text)).await.is_err() {
                    debug!("Stream consumer went away, closing upstream");
                    return;
                }
            }
            if let Step::Finished = step {
                return;
            }
        }
    }
}

fn transport_error(e: reqwest::Error, stage: &str, started: Instant) -> RagError {
    if e.is_timeout() {
        RagError::Timeout {
            stage: stage.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else {
        RagError::http(e.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
