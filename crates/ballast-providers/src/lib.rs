//! Provider implementations for Ballast.
//!
//! This crate provides concrete implementations of the `Provider` trait.
//!
//! # Supported Providers
//!
//! - **Mock**: Testing and development
//! - **Http**: Any OpenAI-compatible chat completions endpoint (hosted APIs,
//!   vLLM, LocalAI, LM Studio, Ollama's compatibility mode)

pub mod factory;
pub mod http;

use async_trait::async_trait;
use ballast_abstraction::{
    GenerationParameters, Provider, ProviderError, ProviderResponse, TokenUsage,
};
use tracing::debug;

pub use factory::{ProviderConfig, ProviderFactory, ProviderKind};
pub use http::HttpProvider;

/// A mock implementation of the `Provider` trait for testing and demonstration.
#[derive(Debug, Default)]
pub struct MockProvider {
    provider_id: String,
    model_id: String,
}

impl MockProvider {
    /// Creates a new `MockProvider` with the given provider and model IDs.
    #[must_use]
    pub const fn new(provider_id: String, model_id: String) -> Self {
        Self { provider_id, model_id }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        prompt: &str,
        parameters: Option<GenerationParameters>,
    ) -> Result<ProviderResponse, ProviderError> {
        debug!(
            provider_id = %self.provider_id,
            model_id = %self.model_id,
            prompt = %prompt,
            parameters = ?parameters,
            "MockProvider generating"
        );

        let response_content = format!(
            "Mock response for: {prompt}\nProvider: {}\nModel: {}",
            self.provider_id, self.model_id
        );

        let input_tokens = count_tokens(prompt);
        let output_tokens = count_tokens(&response_content);
        let total_tokens = input_tokens + output_tokens;

        Ok(ProviderResponse {
            content: response_content,
            model_id: Some(self.model_id.clone()),
            usage: Some(TokenUsage { input_tokens, output_tokens, total_tokens }),
        })
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Count tokens in a string (simplified: word count).
///
/// For a real implementation, this would use a proper tokenizer.
#[allow(clippy::cast_possible_truncation)]
fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_echoes_prompt_with_usage() {
        let provider = MockProvider::new("mock".to_string(), "mock-small".to_string());
        let response = provider.generate("count these five words", None).await.unwrap();

        assert!(response.content.contains("count these five words"));
        assert_eq!(response.model_id, Some("mock-small".to_string()));
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
    }

    #[test]
    fn mock_provider_reports_ids() {
        let provider = MockProvider::new("mock".to_string(), "mock-small".to_string());
        assert_eq!(provider.provider_id(), "mock");
        assert_eq!(provider.model_id(), "mock-small");
    }
}
