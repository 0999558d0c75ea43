//! Resource accounting and admission ceilings for in-flight operations.
//!
//! The governor tracks every reserved operation against system-wide and
//! per-agent ceilings, and runs a periodic sweep that reclaims operations
//! whose drivers never released them. Memory figures are heuristic units,
//! not measured OS values: each active operation is charged
//! `base_cost * (1 + min(elapsed_minutes, cap))`.
//!
//! Unlike the admission layer, this layer fails closed: a denial is returned
//! whenever a ceiling cannot be verified as satisfied.

use crate::config::GovernorConfig;
use crate::error::{GatewayError, Result};
use crate::registry::AgentRegistry;
use crate::types::{Operation, OperationStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One tracked reservation.
#[derive(Debug, Clone)]
struct ActiveEntry {
    /// Agent the operation belongs to.
    agent_name: String,
    /// Base heuristic memory cost.
    base_cost: u64,
    /// When the reservation was made.
    started_at: SystemTime,
    /// Execution-time ceiling for this operation.
    deadline: SystemTime,
}

impl ActiveEntry {
    /// Current heuristic memory charge for this entry.
    fn current_memory(&self, now: SystemTime, cap_minutes: u64) -> u64 {
        let elapsed_minutes =
            now.duration_since(self.started_at).map_or(0, |elapsed| elapsed.as_secs() / 60);
        self.base_cost * (1 + elapsed_minutes.min(cap_minutes))
    }
}

/// Reservation removed by the sweep before its driver released it.
#[derive(Debug, Clone, Copy)]
struct ForcedEntry {
    /// Terminal status the sweep assigned.
    status: OperationStatus,
    /// When the sweep removed the reservation.
    at: SystemTime,
}

/// Aggregate usage snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorUsage {
    /// Number of tracked operations.
    pub active_operations: usize,
    /// Heuristic memory units in use.
    pub memory_units: u64,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Operations forced out for exceeding their execution ceiling.
    pub timed_out: Vec<Uuid>,
    /// Operations purged for exceeding the hard staleness ceiling.
    pub purged: Vec<Uuid>,
    /// Operations cancelled to shed emergency memory pressure.
    pub shed: Vec<Uuid>,
}

impl SweepReport {
    /// Returns `true` when the pass reclaimed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.purged.is_empty() && self.shed.is_empty()
    }
}

/// Resource governor enforcing memory, concurrency, prompt, and token
/// ceilings.
pub struct ResourceGovernor {
    /// Governor configuration.
    config: GovernorConfig,
    /// Agent registry for per-agent budget lookup.
    registry: Arc<AgentRegistry>,
    /// Tracked reservations by operation id.
    active: Arc<RwLock<HashMap<Uuid, ActiveEntry>>>,
    /// Reservations removed by the sweep, awaiting driver acknowledgement.
    forced: Arc<RwLock<HashMap<Uuid, ForcedEntry>>>,
    /// Shutdown signal for the background sweeper.
    sweep_tx: Mutex<Option<watch::Sender<()>>>,
}

impl fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("active_count", &self.active.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    /// Creates a new resource governor.
    ///
    /// # Arguments
    /// * `config` - Governor ceilings and sweep settings
    /// * `registry` - Registry providing per-agent budgets
    #[must_use]
    pub fn new(config: GovernorConfig, registry: Arc<AgentRegistry>) -> Self {
        Self {
            config,
            registry,
            active: Arc::new(RwLock::new(HashMap::new())),
            forced: Arc::new(RwLock::new(HashMap::new())),
            sweep_tx: Mutex::new(None),
        }
    }

    /// Reserves resources for an operation.
    ///
    /// Ceilings are checked in a fixed order: system memory, system
    /// concurrency, agent memory, agent concurrency, prompt length, token
    /// estimate. The first failing check names the denial reason and nothing
    /// is reserved.
    ///
    /// # Errors
    /// Returns [`GatewayError::ResourceDenied`] when any ceiling would be
    /// exceeded.
    pub async fn reserve(&self, operation: &Operation) -> Result<()> {
        let limits = self.registry.limits_for(&operation.agent_name).await;
        let budget = limits.budget;
        let cost = operation.estimate.memory_units;
        let cap = self.config.memory_growth_cap_minutes;
        let now = SystemTime::now();

        let mut active = self.active.write().await;

        let mut system_memory = 0u64;
        let mut agent_memory = 0u64;
        let mut agent_count = 0usize;
        for entry in active.values() {
            let memory = entry.current_memory(now, cap);
            system_memory += memory;
            if entry.agent_name == operation.agent_name {
                agent_memory += memory;
                agent_count += 1;
            }
        }

        if system_memory + cost > self.config.max_memory_units {
            return Err(Self::deny(format!(
                "System memory ceiling reached ({} of {} units in use)",
                system_memory, self.config.max_memory_units
            )));
        }
        if active.len() >= self.config.max_concurrent {
            return Err(Self::deny(format!(
                "System concurrency ceiling reached ({} operations active)",
                active.len()
            )));
        }
        if agent_memory + cost > budget.max_memory_units {
            return Err(Self::deny(format!(
                "Agent '{}' memory ceiling reached ({} of {} units in use)",
                operation.agent_name, agent_memory, budget.max_memory_units
            )));
        }
        if agent_count >= budget.max_concurrent {
            return Err(Self::deny(format!(
                "Agent '{}' concurrency ceiling reached ({agent_count} operations active)",
                operation.agent_name
            )));
        }
        if operation.estimate.prompt_length > budget.max_prompt_length {
            return Err(Self::deny(format!(
                "Prompt length {} exceeds the {} byte limit for agent '{}'",
                operation.estimate.prompt_length, budget.max_prompt_length, operation.agent_name
            )));
        }
        if operation.estimate.estimated_tokens > budget.max_tokens {
            return Err(Self::deny(format!(
                "Estimated {} tokens exceed the {} token limit for agent '{}'",
                operation.estimate.estimated_tokens, budget.max_tokens, operation.agent_name
            )));
        }

        active.insert(
            operation.id,
            ActiveEntry {
                agent_name: operation.agent_name.clone(),
                base_cost: cost,
                started_at: now,
                deadline: now + budget.max_execution,
            },
        );
        debug!(
            operation_id = %operation.id,
            agent = %operation.agent_name,
            memory_units = cost,
            active = active.len(),
            "Reserved resources"
        );
        Ok(())
    }

    /// Releases a reservation.
    ///
    /// Release is idempotent: both the completion path and the timeout path
    /// may call it, and only the first call releases anything.
    ///
    /// # Returns
    /// Returns `true` if this call released the reservation, `false` if the
    /// operation was not tracked (already released or swept).
    pub async fn release(&self, operation_id: Uuid) -> bool {
        let mut active = self.active.write().await;
        if active.remove(&operation_id).is_some() {
            debug!(operation_id = %operation_id, active = active.len(), "Released resources");
            true
        } else {
            debug!(operation_id = %operation_id, "Release for untracked operation");
            false
        }
    }

    /// Takes the terminal status the sweep assigned to a forced-out
    /// operation, if any.
    ///
    /// Drivers call this after a failed [`release`](Self::release) to learn
    /// whether the sweep timed out or cancelled their operation.
    pub async fn take_forced(&self, operation_id: Uuid) -> Option<OperationStatus> {
        let mut forced = self.forced.write().await;
        forced.remove(&operation_id).map(|entry| entry.status)
    }

    /// Returns the system-wide usage snapshot.
    pub async fn usage(&self) -> GovernorUsage {
        let active = self.active.read().await;
        let now = SystemTime::now();
        let cap = self.config.memory_growth_cap_minutes;
        GovernorUsage {
            active_operations: active.len(),
            memory_units: active.values().map(|e| e.current_memory(now, cap)).sum(),
        }
    }

    /// Returns the usage snapshot for one agent.
    pub async fn agent_usage(&self, agent_name: &str) -> GovernorUsage {
        let active = self.active.read().await;
        let now = SystemTime::now();
        let cap = self.config.memory_growth_cap_minutes;
        let mut usage = GovernorUsage::default();
        for entry in active.values() {
            if entry.agent_name == agent_name {
                usage.active_operations += 1;
                usage.memory_units += entry.current_memory(now, cap);
            }
        }
        usage
    }

    /// Returns the number of tracked operations.
    pub async fn active_count(&self) -> usize {
        let active = self.active.read().await;
        active.len()
    }

    /// Runs one reclamation pass.
    ///
    /// In order: force-times-out operations past their execution ceiling,
    /// purges operations older than the hard staleness ceiling regardless of
    /// status, then sheds the oldest quarter of remaining operations when
    /// memory usage has crossed the emergency threshold.
    pub async fn sweep(&self) -> SweepReport {
        Self::run_sweep(&self.active, &self.forced, &self.config).await
    }

    /// Starts the background sweeper task.
    ///
    /// # Errors
    /// Returns an error if the sweeper is already running.
    pub async fn start_sweeper(&self) -> std::result::Result<(), String> {
        let mut tx_slot = self.sweep_tx.lock().await;
        if tx_slot.is_some() {
            return Err("Resource sweeper is already running".to_string());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        *tx_slot = Some(shutdown_tx);

        let active = Arc::clone(&self.active);
        let forced = Arc::clone(&self.forced);
        let config = self.config.clone();

        tokio::spawn(async move {
            info!("Resource sweeper started");

            let mut interval = time::interval(config.sweep_interval());

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Resource sweeper shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = Self::run_sweep(&active, &forced, &config).await;
                        if !report.is_empty() {
                            info!(
                                timed_out = report.timed_out.len(),
                                purged = report.purged.len(),
                                shed = report.shed.len(),
                                "Resource sweep reclaimed operations"
                            );
                        }
                    }
                }
            }

            info!("Resource sweeper stopped");
        });

        Ok(())
    }

    /// Stops the background sweeper task.
    ///
    /// # Errors
    /// Returns an error if the sweeper is not running.
    pub async fn stop_sweeper(&self) -> std::result::Result<(), String> {
        match self.sweep_tx.lock().await.take() {
            Some(shutdown_tx) => {
                let _ = shutdown_tx.send(());
                Ok(())
            }
            None => Err("Resource sweeper is not running".to_string()),
        }
    }

    /// Checks if the background sweeper is running.
    pub async fn is_sweeping(&self) -> bool {
        self.sweep_tx.lock().await.is_some()
    }

    fn deny(reason: String) -> GatewayError {
        debug!(reason = %reason, "Resource reservation denied");
        GatewayError::ResourceDenied { reason }
    }

    async fn run_sweep(
        active: &RwLock<HashMap<Uuid, ActiveEntry>>,
        forced: &RwLock<HashMap<Uuid, ForcedEntry>>,
        config: &GovernorConfig,
    ) -> SweepReport {
        let now = SystemTime::now();
        let stale_cutoff = config.stale_after();
        let mut report = SweepReport::default();

        let mut active = active.write().await;

        let expired: Vec<Uuid> =
            active.iter().filter(|(_, e)| now >= e.deadline).map(|(id, _)| *id).collect();
        for id in expired {
            if let Some(entry) = active.remove(&id) {
                warn!(
                    operation_id = %id,
                    agent = %entry.agent_name,
                    "Force-timed-out operation past its execution ceiling"
                );
                report.timed_out.push(id);
            }
        }

        let stale: Vec<Uuid> = active
            .iter()
            .filter(|(_, e)| {
                now.duration_since(e.started_at).map_or(false, |age| age >= stale_cutoff)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(entry) = active.remove(&id) {
                warn!(
                    operation_id = %id,
                    agent = %entry.agent_name,
                    "Purged stale operation past the safety ceiling"
                );
                report.purged.push(id);
            }
        }

        let cap = config.memory_growth_cap_minutes;
        let memory_in_use: u64 = active.values().map(|e| e.current_memory(now, cap)).sum();
        let utilization = memory_in_use as f64 / config.max_memory_units as f64;
        if utilization >= config.emergency_threshold && !active.is_empty() {
            let mut by_age: Vec<(Uuid, SystemTime)> =
                active.iter().map(|(id, e)| (*id, e.started_at)).collect();
            by_age.sort_by_key(|(_, started_at)| *started_at);

            let shed_count = by_age.len().div_ceil(4);
            for (id, _) in by_age.into_iter().take(shed_count) {
                if let Some(entry) = active.remove(&id) {
                    warn!(
                        operation_id = %id,
                        agent = %entry.agent_name,
                        utilization = utilization,
                        "Shedding operation under emergency memory pressure"
                    );
                    report.shed.push(id);
                }
            }
        }

        drop(active);

        let mut forced = forced.write().await;
        for id in &report.timed_out {
            forced.insert(*id, ForcedEntry { status: OperationStatus::TimedOut, at: now });
        }
        for id in &report.purged {
            forced.insert(*id, ForcedEntry { status: OperationStatus::TimedOut, at: now });
        }
        for id in &report.shed {
            forced.insert(*id, ForcedEntry { status: OperationStatus::Cancelled, at: now });
        }
        forced.retain(|_, entry| {
            now.duration_since(entry.at).map_or(true, |age| age < stale_cutoff)
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentLimits, RateLimits, ResourceBudget};
    use crate::types::{InvokeContext, ResourceEstimate};
    use std::time::Duration;

    fn test_limits() -> AgentLimits {
        AgentLimits {
            budget: ResourceBudget {
                max_memory_units: 1000,
                base_memory_cost: 100,
                max_concurrent: 4,
                max_execution: Duration::from_secs(60),
                max_tokens: 4000,
                max_prompt_length: 10_000,
            },
            rates: RateLimits { per_minute: 60, per_hour: 1000, per_day: 10_000 },
        }
    }

    fn test_config() -> GovernorConfig {
        GovernorConfig {
            max_memory_units: 10_000,
            max_concurrent: 64,
            sweep_interval_ms: 50,
            stale_after_secs: 1800,
            emergency_threshold: 0.95,
            memory_growth_cap_minutes: 10,
        }
    }

    fn test_governor(config: GovernorConfig) -> ResourceGovernor {
        let registry = Arc::new(AgentRegistry::new(test_limits()));
        ResourceGovernor::new(config, registry)
    }

    fn operation(agent: &str) -> Operation {
        Operation::new(
            agent.to_string(),
            InvokeContext::default(),
            ResourceEstimate { memory_units: 100, estimated_tokens: 500, prompt_length: 1000 },
        )
    }

    async fn backdate(governor: &ResourceGovernor, id: Uuid, by: Duration) {
        let mut active = governor.active.write().await;
        if let Some(entry) = active.get_mut(&id) {
            entry.started_at -= by;
            entry.deadline -= by;
        }
    }

    fn denial_reason(result: Result<()>) -> String {
        match result {
            Err(GatewayError::ResourceDenied { reason }) => reason,
            other => panic!("expected ResourceDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_restores_baseline() {
        let governor = test_governor(test_config());

        let mut ids = Vec::new();
        for _ in 0..8 {
            let op = operation("planner");
            governor.reserve(&op).await.unwrap();
            ids.push(op.id);
        }
        assert_eq!(
            governor.usage().await,
            GovernorUsage { active_operations: 8, memory_units: 800 }
        );

        for id in ids {
            assert!(governor.release(id).await);
        }
        assert_eq!(governor.usage().await, GovernorUsage::default());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let governor = test_governor(test_config());
        let op = operation("planner");
        governor.reserve(&op).await.unwrap();

        assert!(governor.release(op.id).await);
        assert!(!governor.release(op.id).await);
        assert_eq!(governor.usage().await, GovernorUsage::default());
    }

    #[tokio::test]
    async fn test_system_memory_ceiling_checked_first() {
        let mut config = test_config();
        config.max_memory_units = 150;
        let governor = test_governor(config);

        governor.reserve(&operation("planner")).await.unwrap();
        // Both the system and agent memory ceilings would now fail; the
        // system check runs first.
        let reason = denial_reason(governor.reserve(&operation("planner")).await);
        assert!(reason.contains("System memory"), "unexpected reason: {reason}");
        assert_eq!(governor.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_system_concurrency_ceiling() {
        let mut config = test_config();
        config.max_concurrent = 2;
        let governor = test_governor(config);

        governor.reserve(&operation("a")).await.unwrap();
        governor.reserve(&operation("b")).await.unwrap();
        let reason = denial_reason(governor.reserve(&operation("c")).await);
        assert!(reason.contains("System concurrency"), "unexpected reason: {reason}");
    }

    #[tokio::test]
    async fn test_agent_ceilings_do_not_affect_other_agents() {
        let governor = test_governor(test_config());

        // The per-agent budget allows 4 concurrent operations.
        for _ in 0..4 {
            governor.reserve(&operation("planner")).await.unwrap();
        }
        let reason = denial_reason(governor.reserve(&operation("planner")).await);
        assert!(reason.contains("concurrency ceiling"), "unexpected reason: {reason}");

        governor.reserve(&operation("reviewer")).await.unwrap();
        assert_eq!(governor.agent_usage("reviewer").await.active_operations, 1);
    }

    #[tokio::test]
    async fn test_prompt_and_token_ceilings() {
        let governor = test_governor(test_config());

        let mut op = operation("planner");
        op.estimate.prompt_length = 20_000;
        let reason = denial_reason(governor.reserve(&op).await);
        assert!(reason.contains("Prompt length"), "unexpected reason: {reason}");

        let mut op = operation("planner");
        op.estimate.estimated_tokens = 5000;
        let reason = denial_reason(governor.reserve(&op).await);
        assert!(reason.contains("tokens exceed"), "unexpected reason: {reason}");

        assert_eq!(governor.usage().await, GovernorUsage::default());
    }

    #[tokio::test]
    async fn test_memory_charge_grows_with_elapsed_time() {
        let governor = test_governor(test_config());
        let op = operation("planner");
        governor.reserve(&op).await.unwrap();

        backdate(&governor, op.id, Duration::from_secs(5 * 60)).await;
        assert_eq!(governor.usage().await.memory_units, 600);

        // Growth stops at the configured cap.
        backdate(&governor, op.id, Duration::from_secs(60 * 60)).await;
        assert_eq!(governor.usage().await.memory_units, 1100);
    }

    #[tokio::test]
    async fn test_sweep_force_times_out_expired_operations() {
        let governor = test_governor(test_config());
        let op = operation("planner");
        governor.reserve(&op).await.unwrap();
        backdate(&governor, op.id, Duration::from_secs(120)).await;

        let report = governor.sweep().await;
        assert_eq!(report.timed_out, vec![op.id]);
        assert_eq!(governor.usage().await, GovernorUsage::default());

        // The driver discovers the forced status exactly once.
        assert!(!governor.release(op.id).await);
        assert_eq!(governor.take_forced(op.id).await, Some(OperationStatus::TimedOut));
        assert_eq!(governor.take_forced(op.id).await, None);
    }

    #[tokio::test]
    async fn test_sweep_purges_stale_operations() {
        let governor = test_governor(test_config());
        let op = operation("planner");
        governor.reserve(&op).await.unwrap();

        // Backdate the start past the staleness ceiling while keeping the
        // deadline in the future, so only the stale pass can reclaim it.
        {
            let mut active = governor.active.write().await;
            let entry = active.get_mut(&op.id).unwrap();
            entry.started_at -= Duration::from_secs(1900);
            entry.deadline = SystemTime::now() + Duration::from_secs(3600);
        }

        let report = governor.sweep().await;
        assert!(report.timed_out.is_empty());
        assert_eq!(report.purged, vec![op.id]);
        assert_eq!(governor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_sheds_oldest_quarter_under_pressure() {
        let mut config = test_config();
        config.max_memory_units = 1000;
        config.emergency_threshold = 0.9;
        let governor = test_governor(config);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut op = operation("planner");
            op.estimate.memory_units = 240;
            governor.reserve(&op).await.unwrap();
            ids.push(op.id);
        }
        // Make the first reservation unambiguously the oldest.
        backdate(&governor, ids[0], Duration::from_secs(10)).await;

        let report = governor.sweep().await;
        assert_eq!(report.shed, vec![ids[0]]);
        assert_eq!(governor.active_count().await, 3);
        assert_eq!(governor.take_forced(ids[0]).await, Some(OperationStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_sweep_below_threshold_sheds_nothing() {
        let governor = test_governor(test_config());
        for _ in 0..4 {
            governor.reserve(&operation("planner")).await.unwrap();
        }

        let report = governor.sweep().await;
        assert!(report.is_empty());
        assert_eq!(governor.active_count().await, 4);
    }

    #[tokio::test]
    async fn test_sweeper_start_stop() {
        let governor = test_governor(test_config());

        assert!(governor.start_sweeper().await.is_ok());
        assert!(governor.is_sweeping().await);
        assert!(governor.start_sweeper().await.is_err());

        assert!(governor.stop_sweeper().await.is_ok());
        assert!(!governor.is_sweeping().await);
        assert!(governor.stop_sweeper().await.is_err());
    }
}
