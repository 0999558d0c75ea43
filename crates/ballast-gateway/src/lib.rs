//! Admission and scheduling gateway for agent inference traffic.
//!
//! Callers submit prompts for named agents; the gateway runs them through
//! rate-limit admission, heuristic resource reservation, priority dispatch,
//! provider routing, and circuit-broken upstream calls, with a result cache
//! in front of the whole pipeline.

pub mod admission;
pub mod balancer;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod governor;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub use admission::{
    AdmissionController, AdmissionDenial, MemoryWindowStore, WindowStore, WindowStoreError,
};
pub use balancer::{BalancerStrategy, LoadBalancer};
pub use breaker::{BreakerOutcome, CircuitBreaker, CircuitState};
pub use cache::{CacheLayer, CacheStats, MemorySharedCache, SharedCache, SharedEntry};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, Result};
pub use events::{EventBus, GatewayEvent, GatewayMetrics};
pub use governor::{GovernorUsage, ResourceGovernor, SweepReport};
pub use registry::{AgentLimits, AgentRegistry, RateLimits, ResourceBudget};
pub use router::{
    CallerSpend, ProviderProfile, ProviderRouter, RouteRequirements, RouteSelection,
};
pub use scheduler::{PendingOperation, RequestScheduler};
pub use types::{
    CallerTier, InvokeContext, InvokeOutcome, Operation, OperationStatus, Priority, QualityTier,
    ResourceEstimate,
};

/// The assembled gateway.
///
/// Wires every component from one [`GatewayConfig`] and exposes the caller
/// surface: invoke, lifecycle control, and observability accessors. The
/// individual components stay public for deployments that need custom wiring,
/// such as an external window store or shared cache.
pub struct Gateway {
    registry: Arc<AgentRegistry>,
    governor: Arc<ResourceGovernor>,
    router: Arc<ProviderRouter>,
    cache: Arc<CacheLayer>,
    events: EventBus,
    scheduler: RequestScheduler,
}

impl Gateway {
    /// Builds a gateway from configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a provider client
    /// cannot be constructed.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let strategy = BalancerStrategy::from_str(&config.router.strategy).ok_or_else(|| {
            GatewayError::Config(ConfigError::Validation(format!(
                "Invalid balancer strategy: {}",
                config.router.strategy
            )))
        })?;

        let registry = Arc::new(AgentRegistry::from_config(&config));
        let balancer = Arc::new(LoadBalancer::new(strategy));
        let router = Arc::new(ProviderRouter::from_config(&config, Arc::clone(&balancer))?);
        let admission = Arc::new(AdmissionController::in_memory(
            Arc::clone(&registry),
            config.admission.clone(),
        ));
        let governor =
            Arc::new(ResourceGovernor::new(config.governor.clone(), Arc::clone(&registry)));
        let events = EventBus::new();
        let breakers =
            Arc::new(CircuitBreaker::new(config.breaker.clone()).with_events(events.clone()));
        let cache =
            Arc::new(CacheLayer::in_memory(config.cache.l1_capacity, config.cache.default_ttl()));
        let scheduler = RequestScheduler::new(
            &config,
            Arc::clone(&registry),
            admission,
            Arc::clone(&governor),
            Arc::clone(&router),
            breakers,
            balancer,
            Arc::clone(&cache),
            events.clone(),
        );

        Ok(Self { registry, governor, router, cache, events, scheduler })
    }

    /// Builds a gateway from a TOML configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated, or
    /// if a provider client cannot be constructed.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        Self::from_config(GatewayConfig::load(path)?)
    }

    /// Starts the dispatch loop and the resource sweeper.
    ///
    /// # Errors
    /// Returns an error if the gateway is already running.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.map_err(GatewayError::Internal)?;
        self.governor.start_sweeper().await.map_err(GatewayError::Internal)?;
        info!("Gateway started");
        Ok(())
    }

    /// Stops the dispatch loop and the resource sweeper.
    ///
    /// In-flight operations run to completion; queued operations stay queued
    /// until the gateway is started again.
    ///
    /// # Errors
    /// Returns an error if the gateway is not running.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await.map_err(GatewayError::Internal)?;
        self.governor.stop_sweeper().await.map_err(GatewayError::Internal)?;
        info!("Gateway stopped");
        Ok(())
    }

    /// Checks if the dispatch loop is running.
    pub async fn is_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    /// Submits a prompt for the named agent and waits for the outcome.
    ///
    /// # Errors
    /// Returns any admission, resource, queue, or upstream error.
    pub async fn invoke(
        &self,
        agent_name: &str,
        prompt: &str,
        context: InvokeContext,
    ) -> Result<InvokeOutcome> {
        self.scheduler.invoke(agent_name, prompt, context).await
    }

    /// Submits a prompt without waiting for the outcome.
    ///
    /// # Errors
    /// Returns [`GatewayError::QueueFull`] when the dispatch queue is at
    /// capacity.
    pub async fn enqueue(
        &self,
        agent_name: &str,
        prompt: &str,
        context: InvokeContext,
    ) -> Result<PendingOperation> {
        self.scheduler.enqueue(agent_name, prompt, context).await
    }

    /// Requests cancellation of a queued or in-flight operation.
    ///
    /// # Returns
    /// Returns `true` if the operation was still tracked, `false` if it is
    /// unknown or already finished.
    pub async fn cancel(&self, operation_id: Uuid) -> bool {
        self.scheduler.cancel(operation_id).await
    }

    /// Subscribes to gateway lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Gets the current metrics snapshot.
    pub async fn metrics(&self) -> GatewayMetrics {
        self.events.snapshot().await
    }

    /// Gets the current system-wide resource usage.
    pub async fn resource_usage(&self) -> GovernorUsage {
        self.governor.usage().await
    }

    /// Gets the current spend snapshot for a caller, if any spend has been
    /// recorded.
    #[must_use]
    pub fn caller_spend(&self, caller_id: &str) -> Option<CallerSpend> {
        self.router.caller_spend(caller_id)
    }

    /// Drops every cached result for an agent.
    ///
    /// # Returns
    /// Returns the number of entries removed.
    pub async fn invalidate_agent_cache(&self, agent_name: &str) -> usize {
        self.cache.delete_prefix(&CacheLayer::agent_prefix(agent_name)).await
    }

    /// Returns the number of operations waiting in the dispatch queue.
    pub async fn pending_count(&self) -> usize {
        self.scheduler.pending_count().await
    }

    /// The agent limits registry, for runtime registration changes.
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }
}
