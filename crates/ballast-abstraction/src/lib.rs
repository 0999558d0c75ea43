//! Provider abstraction layer for Ballast.
//!
//! This module defines the core trait and types for calling external
//! inference providers. The gateway treats any conforming implementation
//! interchangeably.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when calling an inference provider.
///
/// Variants are classified rather than free-form so that callers can decide
/// retry behavior by matching, never by inspecting message text.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// The provider signaled rate limiting or quota exhaustion.
    #[error("Provider '{provider}' rate limited{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    RateLimited {
        /// The provider name (e.g., "openai", "gemini").
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The provider returned a 5xx-class server error.
    #[error("Server Error: {0}")]
    ServerError(String),

    /// The request to the provider timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A network-level failure before any response was received.
    #[error("Network Error: {0}")]
    Network(String),

    /// Authentication with the provider failed.
    #[error("Authentication Failed: {0}")]
    AuthFailed(String),

    /// The provider rejected the request as malformed.
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The provider is not supported or configured.
    #[error("Unsupported Provider: {0}")]
    UnsupportedProvider(String),
}

impl ProviderError {
    /// Returns `true` when the failure class is transient and worth retrying.
    ///
    /// Rate limiting, server errors, timeouts, and network failures are
    /// transient; authentication and request-shape failures are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError(_) | Self::Timeout(_) | Self::Network(_)
        )
    }
}

/// Parameters for controlling the provider's generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// What sampling temperature to use, between 0 and 2.
    /// Higher values mean the model will take more risks.
    pub temperature: Option<f32>,

    /// An alternative to sampling with temperature, called nucleus sampling,
    /// where the model considers the results of the tokens with `top_p` probability mass.
    pub top_p: Option<f32>,

    /// The maximum number of tokens to generate in the completion.
    pub max_tokens: Option<u32>,

    /// Up to 4 sequences where the provider will stop generating further tokens.
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            top_p: Some(1.0),
            max_tokens: Some(512),
            stop_sequences: None,
        }
    }
}

/// The response from a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated content.
    pub content: String,

    /// Optional: The ID of the model that generated the response.
    pub model_id: Option<String>,

    /// Optional: Token usage for the request.
    pub usage: Option<TokenUsage>,
}

/// Token usage for a single provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt.
    pub input_tokens: u32,

    /// Number of tokens in the completion.
    pub output_tokens: u32,

    /// Total number of tokens used.
    pub total_tokens: u32,
}

/// A trait for calling external inference providers.
///
/// All providers must be `Send + Sync` to allow concurrent use across threads.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generates a completion for the given prompt.
    ///
    /// # Arguments
    /// * `prompt` - The input prompt
    /// * `parameters` - Optional parameters to control generation
    ///
    /// # Errors
    /// Returns a `ProviderError` if generation fails.
    async fn generate(
        &self,
        prompt: &str,
        parameters: Option<GenerationParameters>,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Returns the ID of the provider (e.g., "openai").
    fn provider_id(&self) -> &str;

    /// Returns the ID of the model served by this instance.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let err = ProviderError::RateLimited { provider: "openai".to_string(), message: None };
        assert!(err.is_retryable());
        assert!(ProviderError::ServerError("502".to_string()).is_retryable());
        assert!(ProviderError::Timeout("30s elapsed".to_string()).is_retryable());
        assert!(ProviderError::Network("connection reset".to_string()).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!ProviderError::AuthFailed("bad key".to_string()).is_retryable());
        assert!(!ProviderError::InvalidRequest("missing prompt".to_string()).is_retryable());
        assert!(!ProviderError::Serialization("bad json".to_string()).is_retryable());
    }

    #[test]
    fn rate_limited_display_includes_provider_and_message() {
        let err = ProviderError::RateLimited {
            provider: "gemini".to_string(),
            message: Some("quota exhausted".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("gemini"));
        assert!(text.contains("quota exhausted"));
    }
}
