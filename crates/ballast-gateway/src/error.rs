// Error types for the gateway

use crate::config::ConfigError;
use ballast_abstraction::ProviderError;
use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway errors
///
/// Each variant carries a stable `code()` for external consumers, and
/// admission denials carry a `retry_after()` hint. Retryability is decided
/// by variant, never by message text.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A rate or burst scope rejected the request.
    #[error("Admission denied ({scope}): retry after {}ms", retry_after.as_millis())]
    AdmissionDenied {
        /// The scope that rejected the request (e.g., "per-minute").
        scope: String,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// A resource ceiling or budget rejected the request.
    #[error("Resource denied: {reason}")]
    ResourceDenied {
        /// Which ceiling was hit.
        reason: String,
    },

    /// A transient upstream failure (timeout, 5xx, provider rate limit).
    #[error("Transient upstream failure: {message}")]
    UpstreamTransient {
        /// Description of the failure.
        message: String,
    },

    /// A permanent upstream failure (authentication, malformed request).
    #[error("Permanent upstream failure: {message}")]
    UpstreamPermanent {
        /// Description of the failure.
        message: String,
    },

    /// The target's circuit is open and no fallback content was available.
    #[error("Circuit open for target '{target}'")]
    CircuitOpen {
        /// The upstream target whose circuit is open.
        target: String,
    },

    /// A cache backend failure. Treated as a miss by the read path.
    #[error("Cache error: {0}")]
    Cache(String),

    /// The dispatch queue is at capacity.
    #[error("Queue full ({capacity} entries)")]
    QueueFull {
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The operation exceeded its execution-time ceiling.
    #[error("Operation timed out after {}ms", elapsed.as_millis())]
    Timeout {
        /// Time the operation had been running.
        elapsed: Duration,
    },

    /// The operation was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error
    #[error("Internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns a stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied { .. } => "ADMISSION_DENIED",
            Self::ResourceDenied { .. } => "RESOURCE_DENIED",
            Self::UpstreamTransient { .. } => "UPSTREAM_TRANSIENT",
            Self::UpstreamPermanent { .. } => "UPSTREAM_PERMANENT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Cache(_) => "CACHE_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns the retry-after hint for admission denials.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AdmissionDenied { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns `true` when the scheduler may retry the operation internally.
    ///
    /// Only transient upstream failures are retried; admission and resource
    /// denials surface immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient { .. })
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        if err.is_retryable() {
            Self::UpstreamTransient { message: err.to_string() }
        } else {
            Self::UpstreamPermanent { message: err.to_string() }
        }
    }
}
