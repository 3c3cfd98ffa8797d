//! rag-llm - Generation backend adapter
//!
//! One [`Generator`](rag_core::Generator) implementation for five
//! providers. Each provider speaks one of two wire formats:
//!
//! - chat completions (mistral, openai, deepseek, groq): `messages` body,
//!   `Authorization: Bearer`, `choices[0].message.content`, stream deltas at
//!   `choices[0].delta.content`, `data: [DONE]` terminator
//! - anthropic messages: `x-api-key` plus `anthropic-version`, `content[0].text`,
//!   `content_block_delta` events carrying `delta.text`, `message_stop` end
//!
//! Streaming runs in a background task that forwards fragments over a
//! bounded channel; dropping the returned stream closes the connection.

mod client;
mod registry;
mod sse;
mod wire;

pub use client::{LlmClient, DEFAULT_STREAM_BUFFER};
pub use registry::ProviderRegistry;
pub use sse::{classify, LineDecoder, SseLine};
pub use wire::{extract_delta, extract_text, request_body, StreamDelta};
