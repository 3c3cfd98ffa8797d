//! Provider-specific request bodies and response extraction.

use serde_json::{json, Value};

use rag_core::{GenerationParams, ProviderProfile, WireFormat};

/// Build the JSON body for one generation call.
pub fn request_body(
    profile: &ProviderProfile,
    prompt: &str,
    params: &GenerationParams,
    stream: bool,
) -> Value {
    let messages = json!([{ "role": "user", "content": prompt }]);

    let mut body = match profile.request_shape {
        WireFormat::ChatCompletions => json!({
            "model": profile.model_name,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        }),
        // max_tokens is mandatory for this API.
        WireFormat::AnthropicMessages => json!({
            "model": profile.model_name,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "messages": messages,
        }),
    };

    if stream {
        body["stream"] = Value::Bool(true);
    }
    body
}

/// Answer text of a single-shot response.
pub fn extract_text(format: WireFormat, envelope: &Value) -> Option<String> {
    let text = match format {
        WireFormat::ChatCompletions => envelope.pointer("/choices/0/message/content"),
        WireFormat::AnthropicMessages => envelope.pointer("/content/0/text"),
    };
    text.and_then(Value::as_str).map(str::to_string)
}

/// What one decoded stream payload means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// An incremental piece of answer text.
    Text(String),
    /// Explicit end of the answer.
    Stop,
    /// A well-formed event carrying no text (role header, ping, ...).
    Empty,
}

/// Interpret one decoded stream payload.
pub fn extract_delta(format: WireFormat, payload: &Value) -> StreamDelta {
    match format {
        WireFormat::ChatCompletions => {
            match payload
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                Some(text) if !text.is_empty() => StreamDelta::Text(text.to_string()),
                _ => StreamDelta::Empty,
            }
        }
        WireFormat::AnthropicMessages => match payload.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => match payload.pointer("/delta/text").and_then(Value::as_str) {
                Some(text) if !text.is_empty() => StreamDelta::Text(text.to_string()),
                _ => StreamDelta::Empty,
            },
            Some("message_stop") => StreamDelta::Stop,
            _ => StreamDelta::Empty,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_core::Provider;

    fn params() -> GenerationParams {
        GenerationParams {
            temperature: 0.3,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_chat_completions_body() {
        let profile = ProviderProfile::builtin(Provider::Groq);
        let body = request_body(&profile, "Bonjour", &params(), false);
        assert_eq!(body["model"], "mixtral-8x7b-32768");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Bonjour");
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_anthropic_body_streaming() {
        let profile = ProviderProfile::builtin(Provider::Anthropic);
        let body = request_body(&profile, "Bonjour", &params(), true);
        assert_eq!(body["model"], "claude-3-haiku-20240307");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_extract_text_per_format() {
        let chat = json!({"choices": [{"message": {"role": "assistant", "content": "60 ans"}}]});
        assert_eq!(
            extract_text(WireFormat::ChatCompletions, &chat).as_deref(),
            Some("60 ans")
        );

        let anthropic = json!({"content": [{"type": "text", "text": "62 ans"}]});
        assert_eq!(
            extract_text(WireFormat::AnthropicMessages, &anthropic).as_deref(),
            Some("62 ans")
        );

        assert_eq!(extract_text(WireFormat::ChatCompletions, &anthropic), None);
    }

    #[test]
    fn test_chat_delta_paths() {
        let delta = json!({"choices": [{"delta": {"content": "La"}}]});
        assert_eq!(
            extract_delta(WireFormat::ChatCompletions, &delta),
            StreamDelta::Text("La".to_string())
        );

        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(extract_delta(WireFormat::ChatCompletions, &role_only), StreamDelta::Empty);
    }

    #[test]
    fn test_anthropic_delta_paths() {
        let delta = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "La"}});
        assert_eq!(
            extract_delta(WireFormat::AnthropicMessages, &delta),
            StreamDelta::Text("La".to_string())
        );
        assert_eq!(
            extract_delta(WireFormat::AnthropicMessages, &json!({"type": "message_stop"})),
            StreamDelta::Stop
        );
        assert_eq!(
            extract_delta(WireFormat::AnthropicMessages, &json!({"type": "ping"})),
            StreamDelta::Empty
        );
    }
}
