//! Provider factory for creating provider instances from configuration.
//!
//! This module provides functionality to create provider instances based on
//! configuration. A single `Http` kind covers every OpenAI-compatible
//! endpoint; the provider ID distinguishes upstream vendors for routing and
//! failure isolation.

use crate::{HttpProvider, MockProvider};
use ballast_abstraction::{Provider, ProviderError};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

/// Provider kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Mock provider for testing.
    Mock,
    /// OpenAI-compatible HTTP endpoint (hosted or local).
    Http,
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "http" | "openai-compatible" | "remote" => Ok(Self::Http),
            _ => Err(()),
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// The kind of provider to create.
    pub kind: ProviderKind,
    /// The provider ID (e.g., "openai", "gemini").
    pub provider_id: String,
    /// The model ID (e.g., "gpt-4o-mini", "gemini-pro").
    pub model_id: String,
    /// Optional API key.
    pub api_key: Option<String>,
    /// Optional base URL (required for Http providers).
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Creates a new `ProviderConfig` with the given kind and IDs.
    ///
    /// # Arguments
    /// * `kind` - The kind of provider
    /// * `provider_id` - The provider ID
    /// * `model_id` - The model ID
    #[must_use]
    pub fn new(kind: ProviderKind, provider_id: String, model_id: String) -> Self {
        Self { kind, provider_id, model_id, api_key: None, base_url: None }
    }

    /// Sets the API key for this configuration.
    ///
    /// # Arguments
    /// * `api_key` - The API key to use
    #[must_use]
    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Sets the base URL for this configuration (required for Http providers).
    ///
    /// # Arguments
    /// * `base_url` - The base URL for the API endpoint (e.g., "http://localhost:8000/v1")
    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }
}

/// Factory for creating provider instances.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Creates a provider instance from the given configuration.
    ///
    /// # Arguments
    /// * `config` - The provider configuration
    ///
    /// # Errors
    /// Returns a `ProviderError` if provider creation fails (e.g., missing base URL).
    pub fn create(config: ProviderConfig) -> Result<Arc<dyn Provider + Send + Sync>, ProviderError> {
        debug!(
            kind = ?config.kind,
            provider_id = %config.provider_id,
            model_id = %config.model_id,
            "Creating provider instance"
        );

        match config.kind {
            ProviderKind::Mock => {
                let provider = MockProvider::new(config.provider_id, config.model_id);
                Ok(Arc::new(provider))
            }
            ProviderKind::Http => {
                let base_url = config.base_url.ok_or_else(|| {
                    ProviderError::UnsupportedProvider(
                        "base_url is required for Http providers. Use ProviderConfig::with_base_url() to set it.".to_string(),
                    )
                })?;

                let provider = if let Some(api_key) = config.api_key {
                    HttpProvider::with_api_key(
                        config.provider_id,
                        config.model_id,
                        base_url,
                        api_key,
                    )
                } else {
                    HttpProvider::without_auth(config.provider_id, config.model_id, base_url)
                };
                Ok(Arc::new(provider))
            }
        }
    }

    /// Creates a provider instance from a kind string and IDs.
    ///
    /// # Arguments
    /// * `kind_str` - String representation of the provider kind
    /// * `provider_id` - The provider ID
    /// * `model_id` - The model ID
    ///
    /// # Errors
    /// Returns a `ProviderError` if the kind is unrecognized or creation fails.
    pub fn create_from_str(
        kind_str: &str,
        provider_id: String,
        model_id: String,
    ) -> Result<Arc<dyn Provider + Send + Sync>, ProviderError> {
        let kind = ProviderKind::from_str(kind_str).map_err(|()| {
            error!(kind = %kind_str, "Unrecognized provider kind");
            ProviderError::UnsupportedProvider(format!("Unrecognized provider kind: {}", kind_str))
        })?;

        let config = ProviderConfig::new(kind, provider_id, model_id);
        Self::create(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_from_str() {
        assert_eq!(ProviderKind::from_str("mock"), Ok(ProviderKind::Mock));
        assert_eq!(ProviderKind::from_str("Mock"), Ok(ProviderKind::Mock));
        assert_eq!(ProviderKind::from_str("http"), Ok(ProviderKind::Http));
        assert_eq!(ProviderKind::from_str("openai-compatible"), Ok(ProviderKind::Http));
        assert_eq!(ProviderKind::from_str("remote"), Ok(ProviderKind::Http));
        assert_eq!(ProviderKind::from_str("unknown"), Err(()));
    }

    #[test]
    fn test_provider_config_builders() {
        let config =
            ProviderConfig::new(ProviderKind::Http, "openai".to_string(), "gpt-4o".to_string());
        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key, None);
        assert_eq!(config.base_url, None);

        let config = config
            .with_api_key("test-key".to_string())
            .with_base_url("https://api.openai.com/v1".to_string());
        assert_eq!(config.api_key, Some("test-key".to_string()));
        assert_eq!(config.base_url, Some("https://api.openai.com/v1".to_string()));
    }

    #[test]
    fn test_factory_create_mock() {
        let config =
            ProviderConfig::new(ProviderKind::Mock, "mock".to_string(), "mock-model".to_string());
        let provider = ProviderFactory::create(config).unwrap();
        assert_eq!(provider.provider_id(), "mock");
        assert_eq!(provider.model_id(), "mock-model");
    }

    #[test]
    fn test_factory_create_http_requires_base_url() {
        let config =
            ProviderConfig::new(ProviderKind::Http, "openai".to_string(), "gpt-4o".to_string());
        let result = ProviderFactory::create(config);
        assert!(matches!(result, Err(ProviderError::UnsupportedProvider(_))));
    }

    #[test]
    fn test_factory_create_http_with_base_url() {
        let config =
            ProviderConfig::new(ProviderKind::Http, "local".to_string(), "llama-3".to_string())
                .with_base_url("http://localhost:8000/v1".to_string());
        let provider = ProviderFactory::create(config).unwrap();
        assert_eq!(provider.provider_id(), "local");
        assert_eq!(provider.model_id(), "llama-3");
    }

    #[test]
    fn test_factory_create_from_str() {
        let provider = ProviderFactory::create_from_str(
            "mock",
            "mock".to_string(),
            "mock-model".to_string(),
        )
        .unwrap();
        assert_eq!(provider.model_id(), "mock-model");
    }

    #[test]
    fn test_factory_create_invalid_kind() {
        let result = ProviderFactory::create_from_str(
            "invalid",
            "test".to_string(),
            "test-model".to_string(),
        );
        assert!(result.is_err());
    }
}
