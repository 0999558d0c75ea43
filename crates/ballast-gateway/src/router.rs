//! Provider selection: capability filtering, tier preferences, degraded
//! cooldowns, fallback, and per-caller spend budgets.
//!
//! Selection order: the caller's budget is checked first, so an exhausted
//! caller is denied before any provider work happens. Capable, healthy
//! candidates from the quality tier's preference list form the pool handed
//! to the load balancer; when the pool is empty the static fallback chain
//! is walked in order as a last resort.

use crate::balancer::LoadBalancer;
use crate::config::{BudgetConfig, ConfigError, GatewayConfig, ProviderProfileConfig};
use crate::error::{GatewayError, Result};
use crate::types::{CallerTier, QualityTier};
use ballast_abstraction::{Provider, TokenUsage};
use ballast_providers::{ProviderConfig, ProviderFactory, ProviderKind};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Runtime view of one configured provider.
pub struct ProviderProfile {
    /// Provider id (e.g., "openai", "gemini").
    pub id: String,
    /// Model served by this entry.
    pub model: String,
    /// Cost per million tokens in USD.
    pub cost_per_million_tokens: f64,
    /// Whether the model accepts image input.
    pub supports_vision: bool,
    /// Maximum context window in tokens.
    pub max_context_tokens: u32,
    /// The instantiated provider client.
    provider: Arc<dyn Provider + Send + Sync>,
}

impl fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("cost_per_million_tokens", &self.cost_per_million_tokens)
            .field("supports_vision", &self.supports_vision)
            .field("max_context_tokens", &self.max_context_tokens)
            .finish_non_exhaustive()
    }
}

impl ProviderProfile {
    /// Creates a profile around an already constructed provider client.
    ///
    /// Configuration-driven profiles go through
    /// [`ProviderRouter::from_config`]; this constructor exists for embedders
    /// supplying their own [`Provider`] implementations.
    #[must_use]
    pub fn new(
        id: String,
        model: String,
        cost_per_million_tokens: f64,
        supports_vision: bool,
        max_context_tokens: u32,
        provider: Arc<dyn Provider + Send + Sync>,
    ) -> Self {
        Self { id, model, cost_per_million_tokens, supports_vision, max_context_tokens, provider }
    }

    fn build(id: &str, config: &ProviderProfileConfig) -> Result<Self> {
        let kind = ProviderKind::from_str(&config.kind).map_err(|()| {
            ConfigError::Validation(format!(
                "provider '{id}' has unrecognized kind '{}'",
                config.kind
            ))
        })?;

        let mut provider_config =
            ProviderConfig::new(kind, id.to_string(), config.model.clone());
        if let Some(base_url) = &config.base_url {
            provider_config = provider_config.with_base_url(base_url.clone());
        }
        if let Some(api_key) = &config.api_key {
            provider_config = provider_config.with_api_key(api_key.clone());
        }

        let provider = ProviderFactory::create(provider_config).map_err(|e| {
            ConfigError::Validation(format!("provider '{id}' could not be created: {e}"))
        })?;

        Ok(Self {
            id: id.to_string(),
            model: config.model.clone(),
            cost_per_million_tokens: config.cost_per_million_tokens,
            supports_vision: config.supports_vision,
            max_context_tokens: config.max_context_tokens,
            provider,
        })
    }
}

/// Capability requirements for one selection.
#[derive(Debug, Clone, Default)]
pub struct RouteRequirements {
    /// Requested quality tier.
    pub quality: QualityTier,
    /// Minimum context window the model must offer.
    pub min_context_tokens: u32,
    /// Whether the request carries image input.
    pub needs_vision: bool,
    /// Per-caller cost ceiling; candidates above it are filtered out.
    pub max_cost_per_million_tokens: Option<f64>,
}

/// A routed provider choice.
#[derive(Clone)]
pub struct RouteSelection {
    /// Provider id.
    pub provider_id: String,
    /// Model id.
    pub model: String,
    /// Client to execute the call against.
    pub provider: Arc<dyn Provider + Send + Sync>,
}

impl fmt::Debug for RouteSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSelection")
            .field("provider_id", &self.provider_id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Spend snapshot for one caller in the current calendar windows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallerSpend {
    /// USD spent today.
    pub daily_usd: f64,
    /// USD spent this month.
    pub monthly_usd: f64,
}

/// Per-caller ledger entry keyed to calendar day and month.
#[derive(Debug, Clone)]
struct LedgerEntry {
    day_key: String,
    daily_usd: f64,
    month_key: String,
    monthly_usd: f64,
}

impl LedgerEntry {
    fn new(day_key: &str, month_key: &str) -> Self {
        Self {
            day_key: day_key.to_string(),
            daily_usd: 0.0,
            month_key: month_key.to_string(),
            monthly_usd: 0.0,
        }
    }

    /// Resets any window whose calendar key has moved on.
    fn roll_over(&mut self, day_key: &str, month_key: &str) {
        if self.day_key != day_key {
            self.day_key = day_key.to_string();
            self.daily_usd = 0.0;
        }
        if self.month_key != month_key {
            self.month_key = month_key.to_string();
            self.monthly_usd = 0.0;
        }
    }
}

/// Cumulative per-caller spend tracking.
pub struct BudgetLedger {
    /// Ledger entries by caller id.
    entries: std::sync::RwLock<HashMap<String, LedgerEntry>>,
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("caller_count", &self.entries.try_read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl BudgetLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: std::sync::RwLock::new(HashMap::new()) }
    }

    fn day_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    fn month_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m").to_string()
    }

    /// Records spend for a caller.
    ///
    /// # Errors
    /// Returns an error if the ledger lock is poisoned.
    pub fn record(&self, caller_id: &str, cost_usd: f64) -> std::result::Result<(), String> {
        let now = Utc::now();
        let day_key = Self::day_key(now);
        let month_key = Self::month_key(now);

        let mut entries = self.entries.write().map_err(|e| format!("Lock poisoned: {}", e))?;
        let entry = entries
            .entry(caller_id.to_string())
            .or_insert_with(|| LedgerEntry::new(&day_key, &month_key));
        entry.roll_over(&day_key, &month_key);
        entry.daily_usd += cost_usd;
        entry.monthly_usd += cost_usd;

        debug!(
            caller_id = %caller_id,
            cost_usd = cost_usd,
            daily_usd = entry.daily_usd,
            monthly_usd = entry.monthly_usd,
            "Recorded caller spend"
        );
        Ok(())
    }

    /// Gets the current-window spend for a caller.
    ///
    /// Spend recorded under a previous day or month key reads back as zero.
    ///
    /// # Errors
    /// Returns an error if the ledger lock is poisoned.
    pub fn spend_for(&self, caller_id: &str) -> std::result::Result<CallerSpend, String> {
        let now = Utc::now();
        let day_key = Self::day_key(now);
        let month_key = Self::month_key(now);

        let entries = self.entries.read().map_err(|e| format!("Lock poisoned: {}", e))?;
        Ok(entries.get(caller_id).map_or(CallerSpend::default(), |entry| CallerSpend {
            daily_usd: if entry.day_key == day_key { entry.daily_usd } else { 0.0 },
            monthly_usd: if entry.month_key == month_key { entry.monthly_usd } else { 0.0 },
        }))
    }
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Router over configured providers.
pub struct ProviderRouter {
    /// Provider profiles by id. Static after construction.
    profiles: HashMap<String, ProviderProfile>,
    /// Quality tier to ordered preference list.
    preferences: HashMap<QualityTier, Vec<String>>,
    /// Caller tier to cost ceiling in USD per million tokens.
    tier_cost_ceilings: HashMap<CallerTier, f64>,
    /// Last-resort chain covering all providers regardless of tier.
    fallback_chain: Vec<String>,
    /// Providers in cooldown after an upstream failure.
    degraded_until: RwLock<HashMap<String, SystemTime>>,
    /// Cooldown length applied on failure.
    cooldown: Duration,
    /// Content served when the circuit is open.
    degraded_response: String,
    /// Balancer for spreading traffic over the candidate pool.
    balancer: Arc<LoadBalancer>,
    /// Per-caller spend ledger.
    ledger: BudgetLedger,
    /// Budget limits before tier scaling.
    budgets: BudgetConfig,
}

impl fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("provider_count", &self.profiles.len())
            .field("fallback_chain", &self.fallback_chain)
            .finish_non_exhaustive()
    }
}

impl ProviderRouter {
    /// Builds a router from configuration, instantiating one provider client
    /// per configured profile.
    ///
    /// When no fallback chain is configured, one is derived covering every
    /// provider, cheapest first.
    ///
    /// # Errors
    /// Returns a configuration error if any provider cannot be instantiated.
    pub fn from_config(config: &GatewayConfig, balancer: Arc<LoadBalancer>) -> Result<Self> {
        let mut profiles = HashMap::new();
        for (id, profile_config) in &config.providers {
            let profile = ProviderProfile::build(id, profile_config)?;
            info!(provider_id = %id, model = %profile.model, "Registered provider");
            profiles.insert(id.clone(), profile);
        }

        let fallback_chain = if config.router.fallback_chain.is_empty() {
            let mut ids: Vec<String> = profiles.keys().cloned().collect();
            ids.sort_by(|a, b| {
                profiles[a]
                    .cost_per_million_tokens
                    .partial_cmp(&profiles[b].cost_per_million_tokens)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            debug!(chain = ?ids, "Derived fallback chain by cost");
            ids
        } else {
            config.router.fallback_chain.clone()
        };

        Ok(Self {
            profiles,
            preferences: config.router.preferences.clone(),
            tier_cost_ceilings: config.router.tier_cost_ceilings.clone(),
            fallback_chain,
            degraded_until: RwLock::new(HashMap::new()),
            cooldown: config.router.degraded_cooldown(),
            degraded_response: config.router.degraded_response.clone(),
            balancer,
            ledger: BudgetLedger::new(),
            budgets: config.budgets.clone(),
        })
    }

    /// Registers an additional provider profile.
    ///
    /// The provider is appended to the fallback chain; preference lists are
    /// not modified.
    pub fn register_provider(&mut self, profile: ProviderProfile) {
        if !self.fallback_chain.contains(&profile.id) {
            self.fallback_chain.push(profile.id.clone());
        }
        info!(provider_id = %profile.id, model = %profile.model, "Registered provider");
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Selects a provider for the given requirements.
    ///
    /// Requirements without an explicit cost ceiling pick one up from the
    /// configured per-tier table, if the caller's tier has an entry.
    ///
    /// # Errors
    /// Returns [`GatewayError::ResourceDenied`] when the caller's budget is
    /// exhausted, [`GatewayError::UpstreamTransient`] when every capable
    /// provider is in cooldown, and [`GatewayError::UpstreamPermanent`] when
    /// no provider satisfies the capabilities at all.
    pub async fn select(
        &self,
        requirements: &RouteRequirements,
        caller_id: &str,
        tier: CallerTier,
    ) -> Result<RouteSelection> {
        self.check_budget(caller_id, tier)?;

        let mut requirements = requirements.clone();
        if requirements.max_cost_per_million_tokens.is_none() {
            requirements.max_cost_per_million_tokens =
                self.tier_cost_ceilings.get(&tier).copied();
        }
        let requirements = &requirements;

        let degraded = self.degraded_snapshot().await;

        let preferred: Vec<String> = match self.preferences.get(&requirements.quality) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
                ids.sort();
                ids
            }
        };

        let pool: Vec<String> = preferred
            .iter()
            .filter(|id| self.is_capable(id, requirements) && !degraded.contains(*id))
            .cloned()
            .collect();

        if let Some(choice) = self.balancer.pick(&requirements.quality.to_string(), &pool).await
        {
            let selection = self.selection_for(&choice)?;
            debug!(
                provider_id = %selection.provider_id,
                model = %selection.model,
                quality = %requirements.quality,
                "Selected provider"
            );
            return Ok(selection);
        }

        for id in &self.fallback_chain {
            if !degraded.contains(id) && self.is_capable(id, requirements) {
                warn!(
                    provider_id = %id,
                    quality = %requirements.quality,
                    "No preferred candidate available, using fallback chain"
                );
                return self.selection_for(id);
            }
        }

        if self.profiles.keys().any(|id| self.is_capable(id, requirements)) {
            Err(GatewayError::UpstreamTransient {
                message: "All capable providers are degraded".to_string(),
            })
        } else {
            Err(GatewayError::UpstreamPermanent {
                message: "No provider satisfies the requested capabilities".to_string(),
            })
        }
    }

    /// Marks a provider degraded for the configured cooldown.
    pub async fn mark_degraded(&self, provider_id: &str) {
        let until = SystemTime::now() + self.cooldown;
        let mut degraded = self.degraded_until.write().await;
        degraded.insert(provider_id.to_string(), until);
        warn!(
            provider_id = %provider_id,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "Provider marked degraded"
        );
    }

    /// Checks whether a provider is currently outside any cooldown window.
    pub async fn is_healthy(&self, provider_id: &str) -> bool {
        let now = SystemTime::now();
        let degraded = self.degraded_until.read().await;
        degraded.get(provider_id).map_or(true, |until| now >= *until)
    }

    /// Computes the cost of a call in USD for the given provider.
    #[must_use]
    pub fn cost_of(&self, provider_id: &str, usage: &TokenUsage) -> f64 {
        self.profiles.get(provider_id).map_or(0.0, |profile| {
            f64::from(usage.total_tokens) / 1_000_000.0 * profile.cost_per_million_tokens
        })
    }

    /// Records a call's spend against the caller's budget.
    ///
    /// Ledger failures are logged and do not block the caller.
    ///
    /// # Returns
    /// The computed cost in USD.
    pub fn record_usage(&self, caller_id: &str, provider_id: &str, usage: &TokenUsage) -> f64 {
        let cost = self.cost_of(provider_id, usage);
        if let Err(e) = self.ledger.record(caller_id, cost) {
            warn!(caller_id = %caller_id, error = %e, "Failed to record spend (non-blocking)");
        }
        cost
    }

    /// Gets the current spend snapshot for a caller, if available.
    #[must_use]
    pub fn caller_spend(&self, caller_id: &str) -> Option<CallerSpend> {
        self.ledger.spend_for(caller_id).ok()
    }

    /// Content served in place of a generation while a circuit is open.
    #[must_use]
    pub fn degraded_response(&self) -> &str {
        &self.degraded_response
    }

    /// Gets a provider profile by id.
    #[must_use]
    pub fn profile(&self, provider_id: &str) -> Option<&ProviderProfile> {
        self.profiles.get(provider_id)
    }

    /// Returns all configured provider ids, sorted.
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check_budget(&self, caller_id: &str, tier: CallerTier) -> Result<()> {
        let spend = match self.ledger.spend_for(caller_id) {
            Ok(spend) => spend,
            Err(e) => {
                warn!(caller_id = %caller_id, error = %e, "Budget ledger unavailable, denying");
                return Err(GatewayError::ResourceDenied {
                    reason: "Budget accounting unavailable".to_string(),
                });
            }
        };

        let multiplier = tier.limit_multiplier();
        let daily_limit = self.budgets.daily_usd * multiplier;
        let monthly_limit = self.budgets.monthly_usd * multiplier;

        if spend.daily_usd >= daily_limit {
            debug!(
                caller_id = %caller_id,
                spent_usd = spend.daily_usd,
                limit_usd = daily_limit,
                "Daily budget exhausted"
            );
            return Err(GatewayError::ResourceDenied {
                reason: format!("Daily budget of ${daily_limit:.2} exhausted for caller '{caller_id}'"),
            });
        }
        if spend.monthly_usd >= monthly_limit {
            debug!(
                caller_id = %caller_id,
                spent_usd = spend.monthly_usd,
                limit_usd = monthly_limit,
                "Monthly budget exhausted"
            );
            return Err(GatewayError::ResourceDenied {
                reason: format!(
                    "Monthly budget of ${monthly_limit:.2} exhausted for caller '{caller_id}'"
                ),
            });
        }
        Ok(())
    }

    fn is_capable(&self, provider_id: &str, requirements: &RouteRequirements) -> bool {
        self.profiles.get(provider_id).is_some_and(|profile| {
            profile.max_context_tokens >= requirements.min_context_tokens
                && (!requirements.needs_vision || profile.supports_vision)
                && requirements
                    .max_cost_per_million_tokens
                    .map_or(true, |ceiling| profile.cost_per_million_tokens <= ceiling)
        })
    }

    fn selection_for(&self, provider_id: &str) -> Result<RouteSelection> {
        let profile = self.profiles.get(provider_id).ok_or_else(|| {
            GatewayError::Internal(format!("selected provider '{provider_id}' is not registered"))
        })?;
        Ok(RouteSelection {
            provider_id: profile.id.clone(),
            model: profile.model.clone(),
            provider: Arc::clone(&profile.provider),
        })
    }

    /// Drops expired cooldowns and returns the ids still degraded.
    async fn degraded_snapshot(&self) -> HashSet<String> {
        let now = SystemTime::now();
        let mut degraded = self.degraded_until.write().await;
        degraded.retain(|id, until| {
            if now >= *until {
                debug!(provider_id = %id, "Provider cooldown elapsed");
                false
            } else {
                true
            }
        });
        degraded.keys().cloned().collect()
    }
}
