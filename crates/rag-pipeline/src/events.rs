//! Typed events emitted by a streaming query.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use rag_core::Result;

use crate::response::AnswerSource;

/// Sent once, before any content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMetadata {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub enhanced_queries: Vec<String>,
    pub timestamp: String,
}

/// Sent once after the last chunk of a successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMetadata {
    pub response_time_ms: u64,
    pub search_results: usize,
    pub ranked_results: usize,
    pub context_found: bool,
    pub answer_source: AnswerSource,
}

/// One event of the pipeline's streaming output.
///
/// A well-formed sequence is one `Init`, zero or more `Chunk`s and exactly
/// one terminal `Final` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Init { metadata: InitMetadata },
    Chunk { content: String },
    Final { metadata: FinalMetadata },
    Error { error: String, error_code: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Final { .. } | StreamEvent::Error { .. })
    }

    /// Render as one server-sent-event frame.
    pub fn to_sse(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Receiving end of a streaming query. Dropping it cancels the query and
/// the upstream generation request.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
