//! TOML configuration file support for the gateway.
//!
//! Every section has usable defaults so deployments only override what they
//! need; `validate` runs after parsing and before any component is built.

use crate::balancer::BalancerStrategy;
use crate::types::{CallerTier, QualityTier};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Gateway configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Queue and dispatch settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry policy for transient upstream failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Admission control settings.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Resource governor ceilings and sweep settings.
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker thresholds and timeouts.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Provider selection settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Per-caller spend budgets.
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Provider profiles keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderProfileConfig>,

    /// Per-agent limit tables keyed by agent name.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    /// Limits applied to agents without an explicit table.
    #[serde(default)]
    pub default_limits: AgentConfig,
}

/// Queue and dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum queued operations before enqueue rejects.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum concurrently executing operations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Dispatch loop tick interval in milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
}

fn default_queue_capacity() -> usize {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_dispatch_interval_ms() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            concurrency: default_concurrency(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Dispatch loop tick interval.
    #[must_use]
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Retry policy for transient upstream failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum dispatch attempts per operation (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry, in milliseconds; doubles per attempt.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for the backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given completed attempt count, capped at the
    /// configured maximum.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.base_backoff_ms.saturating_mul(1_u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Admission control settings for the scopes not defined per agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Per-source-address limit over a one-minute window.
    #[serde(default = "default_source_per_minute")]
    pub source_per_minute: u32,

    /// Maximum requests per (agent, caller) inside the burst window.
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Burst window length in seconds.
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
}

fn default_source_per_minute() -> u32 {
    120
}

fn default_burst_limit() -> u32 {
    10
}

fn default_burst_window_secs() -> u64 {
    10
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            source_per_minute: default_source_per_minute(),
            burst_limit: default_burst_limit(),
            burst_window_secs: default_burst_window_secs(),
        }
    }
}

impl AdmissionConfig {
    /// Burst window length.
    #[must_use]
    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }
}

/// Resource governor ceilings and background sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    /// System-wide heuristic memory ceiling in abstract units.
    #[serde(default = "default_max_memory_units")]
    pub max_memory_units: u64,

    /// System-wide cap on tracked (reserved or active) operations.
    #[serde(default = "default_governor_max_concurrent")]
    pub max_concurrent: usize,

    /// Sweep interval in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Hard safety ceiling: tracked operations older than this are purged
    /// regardless of status, in seconds.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// System memory usage fraction that triggers emergency shedding.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,

    /// Cap on the elapsed-minutes factor in the memory growth heuristic.
    #[serde(default = "default_memory_growth_cap_minutes")]
    pub memory_growth_cap_minutes: u64,
}

fn default_max_memory_units() -> u64 {
    10_000
}

fn default_governor_max_concurrent() -> usize {
    64
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_stale_after_secs() -> u64 {
    1_800
}

fn default_emergency_threshold() -> f64 {
    0.95
}

fn default_memory_growth_cap_minutes() -> u64 {
    10
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_memory_units: default_max_memory_units(),
            max_concurrent: default_governor_max_concurrent(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stale_after_secs: default_stale_after_secs(),
            emergency_threshold: default_emergency_threshold(),
            memory_growth_cap_minutes: default_memory_growth_cap_minutes(),
        }
    }
}

impl GovernorConfig {
    /// Sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Hard safety ceiling for tracked operations.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the local (L1) store.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Default time-to-live for cached results, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_l1_capacity() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { l1_capacity: default_l1_capacity(), default_ttl_secs: default_cache_ttl_secs() }
    }
}

impl CacheConfig {
    /// Default time-to-live for cached results.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Circuit breaker thresholds and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Error rate over the trailing window that opens the circuit.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Trailing window length for error-rate tracking, in seconds.
    #[serde(default = "default_breaker_window_secs")]
    pub window_secs: u64,

    /// Minimum samples in the window before the error rate can trip.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// How long an open circuit waits before admitting trial calls, in milliseconds.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_trials")]
    pub half_open_max_trials: u32,

    /// Per-call timeout, in milliseconds. Kept shorter than any agent's
    /// execution-time ceiling.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_breaker_window_secs() -> u64 {
    300
}

fn default_min_samples() -> usize {
    8
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_trials() -> u32 {
    2
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            window_secs: default_breaker_window_secs(),
            min_samples: default_min_samples(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_trials: default_half_open_max_trials(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    /// Trailing window for error-rate tracking.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Recovery timeout before half-open.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Per-call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Provider selection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Balancing strategy among equally preferred candidates.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Cooldown applied to a provider after an upstream failure, in milliseconds.
    #[serde(default = "default_degraded_cooldown_ms")]
    pub degraded_cooldown_ms: u64,

    /// Static fallback chain covering all providers regardless of tier.
    /// When empty, a chain ordered by ascending cost is derived.
    #[serde(default)]
    pub fallback_chain: Vec<String>,

    /// Content served when every candidate is circuit-broken.
    #[serde(default = "default_degraded_response")]
    pub degraded_response: String,

    /// Quality tier to ordered provider preference list.
    #[serde(default)]
    pub preferences: HashMap<QualityTier, Vec<String>>,

    /// Cost ceiling in USD per million tokens by caller tier. Tiers absent
    /// from the table have no ceiling.
    #[serde(default)]
    pub tier_cost_ceilings: HashMap<CallerTier, f64>,
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

fn default_degraded_cooldown_ms() -> u64 {
    60_000
}

fn default_degraded_response() -> String {
    "The service is temporarily degraded. Please retry shortly.".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            degraded_cooldown_ms: default_degraded_cooldown_ms(),
            fallback_chain: Vec::new(),
            degraded_response: default_degraded_response(),
            preferences: HashMap::new(),
            tier_cost_ceilings: HashMap::new(),
        }
    }
}

impl RouterConfig {
    /// Cooldown applied to a degraded provider.
    #[must_use]
    pub fn degraded_cooldown(&self) -> Duration {
        Duration::from_millis(self.degraded_cooldown_ms)
    }
}

/// Per-caller spend budgets in USD. Tier multipliers scale these upward.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Daily budget per caller.
    #[serde(default = "default_daily_usd")]
    pub daily_usd: f64,

    /// Monthly budget per caller.
    #[serde(default = "default_monthly_usd")]
    pub monthly_usd: f64,
}

fn default_daily_usd() -> f64 {
    25.0
}

fn default_monthly_usd() -> f64 {
    500.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { daily_usd: default_daily_usd(), monthly_usd: default_monthly_usd() }
    }
}

/// One provider profile from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProfileConfig {
    /// Provider kind: "http" or "mock".
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Model served by this provider entry.
    pub model: String,

    /// Base URL for http providers.
    pub base_url: Option<String>,

    /// Optional API key for http providers.
    pub api_key: Option<String>,

    /// Cost per million tokens in USD.
    #[serde(default = "default_cost_per_million")]
    pub cost_per_million_tokens: f64,

    /// Whether the model accepts image input.
    #[serde(default)]
    pub supports_vision: bool,

    /// Maximum context window in tokens.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
}

fn default_provider_kind() -> String {
    "http".to_string()
}

fn default_cost_per_million() -> f64 {
    1.0
}

fn default_max_context_tokens() -> u32 {
    32_768
}

/// Per-agent resource and rate limits.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Heuristic memory ceiling for the agent's tracked operations.
    #[serde(default = "default_agent_max_memory_units")]
    pub max_memory_units: u64,

    /// Base heuristic memory cost of one operation.
    #[serde(default = "default_base_memory_cost")]
    pub base_memory_cost: u64,

    /// Maximum concurrently tracked operations for the agent.
    #[serde(default = "default_agent_max_concurrent")]
    pub max_concurrent: usize,

    /// Execution-time ceiling per operation, in seconds.
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,

    /// Maximum estimated tokens per operation.
    #[serde(default = "default_agent_max_tokens")]
    pub max_tokens: u32,

    /// Maximum prompt length in bytes.
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    /// Requests per (agent, caller) per minute.
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    /// Requests per (agent, caller) per hour.
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,

    /// Requests per (agent, caller) per day.
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

fn default_agent_max_memory_units() -> u64 {
    2_000
}

fn default_base_memory_cost() -> u64 {
    100
}

fn default_agent_max_concurrent() -> usize {
    4
}

fn default_max_execution_secs() -> u64 {
    120
}

fn default_agent_max_tokens() -> u32 {
    8_000
}

fn default_max_prompt_length() -> usize {
    32_768
}

fn default_per_minute() -> u32 {
    60
}

fn default_per_hour() -> u32 {
    1_000
}

fn default_per_day() -> u32 {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_memory_units: default_agent_max_memory_units(),
            base_memory_cost: default_base_memory_cost(),
            max_concurrent: default_agent_max_concurrent(),
            max_execution_secs: default_max_execution_secs(),
            max_tokens: default_agent_max_tokens(),
            max_prompt_length: default_max_prompt_length(),
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
        }
    }
}

impl AgentConfig {
    /// Execution-time ceiling per operation.
    #[must_use]
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }
}

impl GatewayConfig {
    /// Loads gateway configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses gateway configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns error if any section is internally inconsistent or references
    /// an unknown provider.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "scheduler.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::Validation(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "retry.base_backoff_ms ({}) must be <= retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.governor.max_memory_units == 0 || self.governor.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "governor ceilings must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.governor.emergency_threshold)
            || self.governor.emergency_threshold == 0.0
        {
            return Err(ConfigError::Validation(format!(
                "governor.emergency_threshold ({}) must be in (0.0, 1.0]",
                self.governor.emergency_threshold
            )));
        }
        if self.cache.l1_capacity == 0 {
            return Err(ConfigError::Validation(
                "cache.l1_capacity must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_trials == 0 {
            return Err(ConfigError::Validation(
                "breaker thresholds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.breaker.error_rate_threshold)
            || self.breaker.error_rate_threshold == 0.0
        {
            return Err(ConfigError::Validation(format!(
                "breaker.error_rate_threshold ({}) must be in (0.0, 1.0]",
                self.breaker.error_rate_threshold
            )));
        }
        if BalancerStrategy::from_str(&self.router.strategy).is_none() {
            return Err(ConfigError::Validation(format!(
                "Invalid balancer strategy: {}. Valid options: round-robin, least-connections, weighted",
                self.router.strategy
            )));
        }
        if self.budgets.daily_usd <= 0.0 || self.budgets.monthly_usd <= 0.0 {
            return Err(ConfigError::Validation(
                "budgets must be greater than zero".to_string(),
            ));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one provider must be configured".to_string(),
            ));
        }
        for (id, provider) in &self.providers {
            let kind = ballast_providers::ProviderKind::from_str(&provider.kind).map_err(|()| {
                ConfigError::Validation(format!(
                    "Provider '{}' has unrecognized kind '{}'",
                    id, provider.kind
                ))
            })?;
            if kind == ballast_providers::ProviderKind::Http && provider.base_url.is_none() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' is kind 'http' but has no base_url",
                    id
                )));
            }
        }
        for entry in &self.router.fallback_chain {
            if !self.providers.contains_key(entry) {
                return Err(ConfigError::Validation(format!(
                    "router.fallback_chain references unknown provider '{}'",
                    entry
                )));
            }
        }
        for (tier, list) in &self.router.preferences {
            for entry in list {
                if !self.providers.contains_key(entry) {
                    return Err(ConfigError::Validation(format!(
                        "router.preferences.{} references unknown provider '{}'",
                        tier, entry
                    )));
                }
            }
        }
        for (tier, ceiling) in &self.router.tier_cost_ceilings {
            if *ceiling <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "router.tier_cost_ceilings.{} ({}) must be greater than zero",
                    tier, ceiling
                )));
            }
        }
        for (name, agent) in self.agents.iter().chain(std::iter::once((
            &"default_limits".to_string(),
            &self.default_limits,
        ))) {
            if agent.max_concurrent == 0 {
                return Err(ConfigError::Validation(format!(
                    "Agent '{}': max_concurrent must be at least 1",
                    name
                )));
            }
            if agent.max_execution_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "Agent '{}': max_execution_secs must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }
}
