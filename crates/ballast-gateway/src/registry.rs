//! Agent limit registry.
//!
//! This module stores the resource budget and rate limits applied to each
//! agent. Agents without an explicit entry fall back to the default limits,
//! so an unknown agent name never fails a request on its own.

use crate::config::{AgentConfig, GatewayConfig};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Resource ceilings for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBudget {
    /// Heuristic memory ceiling across the agent's tracked operations.
    pub max_memory_units: u64,
    /// Base heuristic memory cost of one operation.
    pub base_memory_cost: u64,
    /// Maximum concurrently tracked operations.
    pub max_concurrent: usize,
    /// Execution-time ceiling per operation.
    pub max_execution: Duration,
    /// Maximum estimated tokens per operation.
    pub max_tokens: u32,
    /// Maximum prompt length in bytes.
    pub max_prompt_length: usize,
}

/// Request rate limits for one (agent, caller) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Requests per minute.
    pub per_minute: u32,
    /// Requests per hour.
    pub per_hour: u32,
    /// Requests per day.
    pub per_day: u32,
}

/// Complete limit table for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLimits {
    /// Resource ceilings.
    pub budget: ResourceBudget,
    /// Rate limits.
    pub rates: RateLimits,
}

impl From<&AgentConfig> for AgentLimits {
    fn from(config: &AgentConfig) -> Self {
        Self {
            budget: ResourceBudget {
                max_memory_units: config.max_memory_units,
                base_memory_cost: config.base_memory_cost,
                max_concurrent: config.max_concurrent,
                max_execution: config.max_execution(),
                max_tokens: config.max_tokens,
                max_prompt_length: config.max_prompt_length,
            },
            rates: RateLimits {
                per_minute: config.per_minute,
                per_hour: config.per_hour,
                per_day: config.per_day,
            },
        }
    }
}

/// Registry of per-agent limits.
pub struct AgentRegistry {
    /// Map of agent name to limit table.
    agents: Arc<RwLock<HashMap<String, AgentLimits>>>,
    /// Limits applied to agents without an explicit entry.
    default_limits: AgentLimits,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_count", &self.agents.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates a new registry with the given default limits.
    #[must_use]
    pub fn new(default_limits: AgentLimits) -> Self {
        Self { agents: Arc::new(RwLock::new(HashMap::new())), default_limits }
    }

    /// Builds a registry from gateway configuration.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        let agents = config
            .agents
            .iter()
            .map(|(name, agent)| (name.clone(), AgentLimits::from(agent)))
            .collect();
        Self {
            agents: Arc::new(RwLock::new(agents)),
            default_limits: AgentLimits::from(&config.default_limits),
        }
    }

    /// Registers limits for an agent.
    ///
    /// # Arguments
    /// * `name` - The agent name
    /// * `limits` - The limit table to apply
    ///
    /// # Returns
    /// Returns `true` if the agent was newly registered, `false` if it replaced an existing entry.
    pub async fn register(&self, name: String, limits: AgentLimits) -> bool {
        debug!(agent = %name, "Registering agent limits");

        let mut agents = self.agents.write().await;
        let was_new = !agents.contains_key(&name);
        agents.insert(name.clone(), limits);

        if !was_new {
            warn!(agent = %name, "Agent limits replaced in registry");
        }

        was_new
    }

    /// Retrieves the limits for an agent, falling back to the defaults.
    ///
    /// # Arguments
    /// * `name` - The agent name to look up
    ///
    /// # Returns
    /// Returns the agent's limit table, or the default limits when no entry exists.
    pub async fn limits_for(&self, name: &str) -> AgentLimits {
        let agents = self.agents.read().await;
        if let Some(limits) = agents.get(name) {
            limits.clone()
        } else {
            debug!(agent = %name, "No explicit limits for agent, using defaults");
            self.default_limits.clone()
        }
    }

    /// Lists the names of all explicitly registered agents.
    pub async fn list_agents(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        agents.keys().cloned().collect()
    }

    /// Removes an agent's explicit limits.
    ///
    /// # Arguments
    /// * `name` - The agent name to unregister
    ///
    /// # Returns
    /// Returns `true` if the agent was found and removed, `false` otherwise.
    pub async fn unregister(&self, name: &str) -> bool {
        debug!(agent = %name, "Unregistering agent limits");

        let mut agents = self.agents.write().await;
        let removed = agents.remove(name).is_some();

        if !removed {
            warn!(agent = %name, "Attempted to unregister non-existent agent");
        }

        removed
    }

    /// Checks if an agent has explicit limits.
    pub async fn is_registered(&self, name: &str) -> bool {
        let agents = self.agents.read().await;
        agents.contains_key(name)
    }

    /// Returns the number of explicitly registered agents.
    pub async fn count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.len()
    }

    /// Returns the default limit table.
    #[must_use]
    pub fn default_limits(&self) -> &AgentLimits {
        &self.default_limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limits(per_minute: u32) -> AgentLimits {
        AgentLimits {
            budget: ResourceBudget {
                max_memory_units: 1_000,
                base_memory_cost: 100,
                max_concurrent: 4,
                max_execution: Duration::from_secs(60),
                max_tokens: 4_000,
                max_prompt_length: 16_384,
            },
            rates: RateLimits { per_minute, per_hour: 100, per_day: 1_000 },
        }
    }

    #[tokio::test]
    async fn test_register_agent() {
        let registry = AgentRegistry::new(test_limits(60));

        let was_new = registry.register("planner".to_string(), test_limits(2)).await;
        assert!(was_new);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_agent() {
        let registry = AgentRegistry::new(test_limits(60));

        let was_new1 = registry.register("planner".to_string(), test_limits(2)).await;
        assert!(was_new1);

        let was_new2 = registry.register("planner".to_string(), test_limits(5)).await;
        assert!(!was_new2); // Should replace existing
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.limits_for("planner").await.rates.per_minute, 5);
    }

    #[tokio::test]
    async fn test_limits_for_falls_back_to_defaults() {
        let registry = AgentRegistry::new(test_limits(60));
        registry.register("planner".to_string(), test_limits(2)).await;

        assert_eq!(registry.limits_for("planner").await.rates.per_minute, 2);
        assert_eq!(registry.limits_for("unknown").await.rates.per_minute, 60);
    }

    #[tokio::test]
    async fn test_from_config() {
        let toml = r#"
[providers.mock]
kind = "mock"
model = "mock-model"

[router]
fallback_chain = ["mock"]

[agents.planner]
per_minute = 2
max_concurrent = 2

[default_limits]
per_minute = 30
"#;
        let config = GatewayConfig::from_toml(toml).unwrap();
        let registry = AgentRegistry::from_config(&config);

        assert!(registry.is_registered("planner").await);
        let planner = registry.limits_for("planner").await;
        assert_eq!(planner.rates.per_minute, 2);
        assert_eq!(planner.budget.max_concurrent, 2);
        // Omitted planner fields come from AgentConfig defaults, not [default_limits].
        assert_eq!(planner.rates.per_hour, 1_000);

        let fallback = registry.limits_for("unlisted").await;
        assert_eq!(fallback.rates.per_minute, 30);
    }

    #[tokio::test]
    async fn test_unregister_agent() {
        let registry = AgentRegistry::new(test_limits(60));
        registry.register("planner".to_string(), test_limits(2)).await;
        assert_eq!(registry.count().await, 1);

        let removed = registry.unregister("planner").await;
        assert!(removed);
        assert_eq!(registry.count().await, 0);
        // Lookups now fall back to defaults.
        assert_eq!(registry.limits_for("planner").await.rates.per_minute, 60);
    }

    #[tokio::test]
    async fn test_unregister_nonexistent_agent() {
        let registry = AgentRegistry::new(test_limits(60));
        let removed = registry.unregister("nonexistent").await;
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_list_agents() {
        let registry = AgentRegistry::new(test_limits(60));
        registry.register("planner".to_string(), test_limits(2)).await;
        registry.register("researcher".to_string(), test_limits(10)).await;

        let agents = registry.list_agents().await;
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().any(|name| name == "planner"));
        assert!(agents.iter().any(|name| name == "researcher"));
    }
}
