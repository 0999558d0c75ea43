//! OpenAI-compatible HTTP provider implementation.
//!
//! This module implements the `Provider` trait for any server exposing the
//! OpenAI Chat Completions API, which covers hosted APIs as well as local
//! inference servers (vLLM, LocalAI, LM Studio, Ollama's compatibility mode).
//!
//! # Constructor Patterns
//!
//! - `with_api_key()` - Explicit API key for authenticated servers
//! - `without_auth()` - No authentication (most common for local servers)
//!
//! Failures are mapped onto the `ProviderError` taxonomy by HTTP status so
//! that callers can classify retryability without inspecting message text.

use async_trait::async_trait;
use ballast_abstraction::{
    GenerationParameters, Provider, ProviderError, ProviderResponse, TokenUsage,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAI-compatible HTTP provider.
///
/// One instance represents one (provider, model) pairing against a fixed
/// base URL; the gateway constructs one per configured profile.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// The provider identifier (e.g., "openai", "gemini", "local").
    provider_id: String,
    /// The model identifier (e.g., "gpt-4o-mini", "llama-3-70b").
    model_id: String,
    /// Base URL for the API endpoint (e.g., "http://localhost:8000/v1").
    base_url: String,
    /// Optional API key (some local servers don't require auth).
    api_key: Option<String>,
    /// HTTP client for requests.
    client: Client,
}

impl HttpProvider {
    /// Creates a new `HttpProvider` with an explicit API key.
    ///
    /// # Arguments
    /// * `provider_id` - The provider identifier
    /// * `model_id` - The model identifier
    /// * `base_url` - The base URL for the API endpoint
    /// * `api_key` - The API key for authentication
    #[must_use]
    pub fn with_api_key(
        provider_id: String,
        model_id: String,
        base_url: String,
        api_key: String,
    ) -> Self {
        Self {
            provider_id,
            model_id,
            base_url,
            api_key: Some(api_key),
            client: build_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Creates a new `HttpProvider` without authentication.
    ///
    /// Use this constructor for local servers that don't require API keys,
    /// such as LM Studio or local vLLM instances without authentication.
    ///
    /// # Arguments
    /// * `provider_id` - The provider identifier
    /// * `model_id` - The model identifier
    /// * `base_url` - The base URL for the API endpoint
    #[must_use]
    pub fn without_auth(provider_id: String, model_id: String, base_url: String) -> Self {
        Self {
            provider_id,
            model_id,
            base_url,
            api_key: None,
            client: build_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Sets the per-request timeout, rebuilding the underlying client.
    ///
    /// # Arguments
    /// * `timeout` - Maximum time to wait for a response
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    /// Maps a non-success HTTP status to the provider error taxonomy.
    fn classify_status(&self, status: u16, body: String) -> ProviderError {
        let message = extract_error_message(&body);
        match status {
            401 | 403 => ProviderError::AuthFailed(format!("{status}: {message}")),
            402 | 429 => ProviderError::RateLimited {
                provider: self.provider_id.clone(),
                message: Some(message),
            },
            500..=599 => ProviderError::ServerError(format!("{status}: {message}")),
            _ => ProviderError::InvalidRequest(format!("{status}: {message}")),
        }
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|_| Client::new())
}

/// Pulls `error.message` out of an OpenAI-shaped error body, falling back to
/// the raw text when the body is not JSON in that shape.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map_or_else(|| body.to_string(), |envelope| envelope.error.message)
}

#[async_trait]
impl Provider for HttpProvider {
    async fn generate(
        &self,
        prompt: &str,
        parameters: Option<GenerationParameters>,
    ) -> Result<ProviderResponse, ProviderError> {
        debug!(
            provider_id = %self.provider_id,
            model_id = %self.model_id,
            prompt_len = prompt.len(),
            parameters = ?parameters,
            "HttpProvider generating"
        );

        let url = format!("{}/chat/completions", self.base_url);

        let mut request_body = ChatRequest {
            model: self.model_id.clone(),
            messages: vec![ChatRequestMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
        };

        if let Some(params) = parameters {
            request_body.temperature = params.temperature;
            request_body.top_p = params.top_p;
            request_body.max_tokens = params.max_tokens;
            request_body.stop = params.stop_sequences;
        }

        let mut request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            error!(
                error = %e,
                url = %url,
                provider_id = %self.provider_id,
                "Failed to send request to chat completions endpoint"
            );
            if e.is_timeout() {
                ProviderError::Timeout(format!("Request to {} timed out", self.provider_id))
            } else {
                ProviderError::Network(format!("Network error: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text =
                response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                status = %status,
                error = %error_text,
                url = %url,
                provider_id = %self.provider_id,
                "Chat completions endpoint returned error status"
            );
            return Err(self.classify_status(status.as_u16(), error_text));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            error!(
                error = %e,
                url = %url,
                "Failed to parse chat completions response"
            );
            ProviderError::Serialization(format!("Failed to parse response: {}", e))
        })?;

        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| {
                ProviderError::Serialization("Response contained no choices".to_string())
            })?;

        let usage = chat_response.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderResponse { content, model_id: Some(self.model_id.clone()), usage })
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// OpenAI-compatible API request/response structures
// These match the OpenAI API specification and can be used with any compatible server

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatRequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatRequestMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatRequestMessage,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_field_names)] // Matches API naming
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_for(base_url: String) -> HttpProvider {
        HttpProvider::without_auth("test".to_string(), "test-model".to_string(), base_url)
    }

    #[test]
    fn test_http_provider_with_api_key() {
        let provider = HttpProvider::with_api_key(
            "openai".to_string(),
            "gpt-4o-mini".to_string(),
            "http://localhost:8000/v1".to_string(),
            "test-key".to_string(),
        );
        assert_eq!(provider.provider_id(), "openai");
        assert_eq!(provider.model_id(), "gpt-4o-mini");
    }

    #[test]
    fn test_extract_error_message_openai_shape() {
        let body = r#"{"error": {"message": "You exceeded your current quota", "type": "insufficient_quota"}}"#;
        assert_eq!(extract_error_message(body), "You exceeded your current quota");
    }

    #[test]
    fn test_extract_error_message_plain_text() {
        assert_eq!(extract_error_message("service unavailable"), "service unavailable");
    }

    #[tokio::test]
    async fn test_generate_success() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        // Mock successful response
        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "Hello, world!"
                    }
                }],
                "usage": {
                    "prompt_tokens": 10,
                    "completion_tokens": 20,
                    "total_tokens": 30
                }
            }"#,
            )
            .create();

        let provider = provider_for(base_url);
        let response = provider.generate("Say hello", None).await.unwrap();

        assert_eq!(response.content, "Hello, world!");
        assert_eq!(response.model_id, Some("test-model".to_string()));
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.total_tokens, 30);

        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_sends_bearer_auth() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "Authenticated response"
                    }
                }]
            }"#,
            )
            .create();

        let provider = HttpProvider::with_api_key(
            "test".to_string(),
            "test-model".to_string(),
            base_url,
            "test-key".to_string(),
        );

        let response = provider.generate("Test", None).await.unwrap();
        assert_eq!(response.content, "Authenticated response");

        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_maps_401_to_auth_failed() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "Invalid API key"}}"#)
            .create();

        let provider = provider_for(base_url);
        let err = provider.generate("Test", None).await.unwrap_err();

        assert!(matches!(err, ProviderError::AuthFailed(_)));
        assert!(!err.is_retryable());
        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_maps_429_to_rate_limited() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body(r#"{"error": {"message": "Rate limit reached"}}"#)
            .create();

        let provider = provider_for(base_url);
        let err = provider.generate("Test", None).await.unwrap_err();

        match &err {
            ProviderError::RateLimited { provider, message } => {
                assert_eq!(provider, "test");
                assert_eq!(message.as_deref(), Some("Rate limit reached"));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert!(err.is_retryable());
        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_maps_500_to_server_error() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("internal server error")
            .create();

        let provider = provider_for(base_url);
        let err = provider.generate("Test", None).await.unwrap_err();

        assert!(matches!(err, ProviderError::ServerError(_)));
        assert!(err.is_retryable());
        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_maps_400_to_invalid_request() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(400)
            .with_body(r#"{"error": {"message": "messages is required"}}"#)
            .create();

        let provider = provider_for(base_url);
        let err = provider.generate("Test", None).await.unwrap_err();

        assert!(matches!(err, ProviderError::InvalidRequest(_)));
        assert!(!err.is_retryable());
        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_empty_choices_is_serialization_error() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create();

        let provider = provider_for(base_url);
        let err = provider.generate("Test", None).await.unwrap_err();

        assert!(matches!(err, ProviderError::Serialization(_)));
        mock.assert();
    }

    #[tokio::test]
    async fn test_generate_applies_parameters() {
        let mut _m = mockito::Server::new_async().await;
        let mock_url = _m.url();
        let base_url = format!("{}/v1", mock_url);

        let mock = _m
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"model": "test-model", "temperature": 0.2, "max_tokens": 64}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "ok"
                    }
                }]
            }"#,
            )
            .create();

        let provider = provider_for(base_url);
        let params = GenerationParameters {
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(64),
            stop_sequences: None,
        };
        let response = provider.generate("Test", Some(params)).await.unwrap();
        assert_eq!(response.content, "ok");

        mock.assert();
    }
}
