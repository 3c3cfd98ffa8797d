//! Lookup of generation backends by provider.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use rag_core::{GenerationConfig, Generator, Provider, RagError, Result};

use crate::client::LlmClient;

/// One generator per configured provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    generators: HashMap<Provider, Arc<dyn Generator>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP client for every built-in provider.
    ///
    /// Keys are read from the environment now; a provider without a key is
    /// still registered and fails with a missing-credential error on use.
    pub fn from_config(config: &GenerationConfig, stream_buffer: usize) -> Result<Self> {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            let api_key = config.api_key_for(provider);
            debug!(
                "Registering {} (credential {})",
                provider,
                if api_key.is_some() { "present" } else { "missing" }
            );
            let client = LlmClient::new(config.profile_for(provider), api_key)?
                .with_timeouts(config.timeout(), config.stream_timeout())
                .with_stream_buffer(stream_buffer);
            registry.insert(provider, Arc::new(client));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, provider: Provider, generator: Arc<dyn Generator>) {
        self.generators.insert(provider, generator);
    }

    pub fn with(mut self, provider: Provider, generator: Arc<dyn Generator>) -> Self {
        self.insert(provider, generator);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn Generator>> {
        self.generators
            .get(&provider)
            .cloned()
            .ok_or_else(|| RagError::config(format!("Provider {} is not configured", provider)))
    }

    /// Registered providers in table order.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.generators.contains_key(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_registers_all_providers() {
        let registry = ProviderRegistry::from_config(&GenerationConfig::default(), 8).unwrap();
        assert_eq!(registry.providers(), Provider::ALL.to_vec());

        let anthropic = registry.get(Provider::Anthropic).unwrap();
        assert_eq!(anthropic.profile().model_name, "claude-3-haiku-20240307");
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = GenerationConfig::default();
        config.providers.insert(
            "openai".to_string(),
            rag_core::ProviderOverride {
                endpoint_url: Some("http://localhost:8080/v1/chat/completions".to_string()),
                model: Some("local-model".to_string()),
                api_key_env: None,
            },
        );
        let registry = ProviderRegistry::from_config(&config, 8).unwrap();
        let openai = registry.get(Provider::OpenAi).unwrap();
        assert_eq!(openai.profile().model_name, "local-model");
        assert_eq!(
            openai.profile().endpoint_url,
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_unregistered_provider_is_config_error() {
        let registry = ProviderRegistry::new();
        let err = registry.get(Provider::Groq).err().unwrap();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
