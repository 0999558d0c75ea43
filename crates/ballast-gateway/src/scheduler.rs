//! Request scheduling and dispatch.
//!
//! The scheduler is the composition root: callers enqueue invocations into a
//! bounded priority queue, and a background dispatch loop drains it whenever
//! a concurrency slot is free. Each dispatched operation runs admission,
//! resource reservation, provider selection, and the circuit-broken upstream
//! call, then releases its reservation and reports the outcome.

use crate::admission::AdmissionController;
use crate::balancer::LoadBalancer;
use crate::breaker::{BreakerOutcome, CircuitBreaker};
use crate::cache::CacheLayer;
use crate::config::{GatewayConfig, RetryConfig, SchedulerConfig};
use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::governor::ResourceGovernor;
use crate::registry::{AgentRegistry, ResourceBudget};
use crate::router::{ProviderRouter, RouteRequirements};
use crate::types::{InvokeContext, InvokeOutcome, Operation, OperationStatus, ResourceEstimate};
use ballast_abstraction::{GenerationParameters, ProviderResponse, TokenUsage};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Completion-token reserve folded into each operation's token estimate.
const COMPLETION_TOKEN_RESERVE: u32 = 512;

/// One queued invocation awaiting dispatch.
struct QueuedOperation {
    /// The tracked operation.
    operation: Operation,
    /// The prompt to send upstream.
    prompt: String,
    /// Cache key for the invocation, computed at enqueue.
    cache_key: String,
    /// Channel back to the waiting caller.
    responder: oneshot::Sender<Result<InvokeOutcome>>,
    /// Cancellation handle, shared with the scheduler's registry.
    cancel_token: CancellationToken,
    /// Arrival order, for tie-breaking among equal priorities.
    sequence: u64,
}

/// Wrapper for priority queue ordering.
struct PrioritizedEntry(QueuedOperation);

impl PartialEq for PrioritizedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.operation.context.priority == other.0.operation.context.priority
            && self.0.sequence == other.0.sequence
    }
}

impl Eq for PrioritizedEntry {}

impl PartialOrd for PrioritizedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority dispatches first, and
        // among equals the earlier arrival wins.
        self.0
            .operation
            .context
            .priority
            .cmp(&other.0.operation.context.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

/// Handle to an enqueued operation.
#[derive(Debug)]
pub struct PendingOperation {
    /// The operation id assigned at enqueue.
    pub operation_id: Uuid,
    /// Receives the outcome when the operation finishes.
    receiver: oneshot::Receiver<Result<InvokeOutcome>>,
}

impl PendingOperation {
    /// Waits for the operation to finish.
    ///
    /// # Errors
    /// Returns the operation's error, or [`GatewayError::Cancelled`] if the
    /// scheduler dropped the operation before completing it.
    pub async fn outcome(self) -> Result<InvokeOutcome> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Cancelled),
        }
    }
}

/// Components shared with dispatched operation tasks.
struct DispatchShared {
    retry: RetryConfig,
    registry: Arc<AgentRegistry>,
    admission: Arc<AdmissionController>,
    governor: Arc<ResourceGovernor>,
    router: Arc<ProviderRouter>,
    breakers: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<CacheLayer>,
    events: EventBus,
    /// Cancellation tokens for queued and in-flight operations.
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Result of the upstream execution phase.
struct ExecutionResult {
    content: String,
    provider_id: String,
    model: String,
    usage: TokenUsage,
    cost: f64,
    /// Fallback content served while a circuit is open is not cached.
    cacheable: bool,
}

/// Bounded-concurrency request scheduler.
pub struct RequestScheduler {
    /// Queue and dispatch settings.
    config: SchedulerConfig,
    /// Components handed to dispatched tasks.
    shared: Arc<DispatchShared>,
    /// Pending operations, highest priority first.
    pending: Arc<Mutex<BinaryHeap<PrioritizedEntry>>>,
    /// Arrival counter for tie-breaking.
    sequence: AtomicU64,
    /// Concurrency slots for in-flight operations.
    slots: Arc<Semaphore>,
    /// Shutdown signal for the dispatch loop.
    shutdown_tx: Mutex<Option<watch::Sender<()>>>,
}

impl fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("config", &self.config)
            .field("pending_count", &self.pending.try_lock().map(|q| q.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl RequestScheduler {
    /// Creates a new scheduler.
    ///
    /// # Arguments
    /// * `config` - Gateway configuration
    /// * `registry` - Agent limits registry
    /// * `admission` - Admission controller
    /// * `governor` - Resource governor
    /// * `router` - Provider router
    /// * `breakers` - Circuit breakers keyed by provider
    /// * `balancer` - Load balancer shared with the router
    /// * `cache` - Invocation cache
    /// * `events` - Event bus for lifecycle notifications
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<AgentRegistry>,
        admission: Arc<AdmissionController>,
        governor: Arc<ResourceGovernor>,
        router: Arc<ProviderRouter>,
        breakers: Arc<CircuitBreaker>,
        balancer: Arc<LoadBalancer>,
        cache: Arc<CacheLayer>,
        events: EventBus,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            shared: Arc::new(DispatchShared {
                retry: config.retry.clone(),
                registry,
                admission,
                governor,
                router,
                breakers,
                balancer,
                cache,
                events,
                cancellations: Mutex::new(HashMap::new()),
            }),
            pending: Arc::new(Mutex::new(BinaryHeap::new())),
            sequence: AtomicU64::new(0),
            slots: Arc::new(Semaphore::new(config.scheduler.concurrency)),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Enqueues an invocation.
    ///
    /// Identical requests short-circuit through the cache without entering
    /// the queue.
    ///
    /// # Errors
    /// Returns [`GatewayError::QueueFull`] immediately when the queue is at
    /// capacity.
    pub async fn enqueue(
        &self,
        agent_name: &str,
        prompt: &str,
        context: InvokeContext,
    ) -> Result<PendingOperation> {
        let cache_key = CacheLayer::invocation_key(agent_name, context.quality, prompt);

        let cached = match self.shared.cache.get(&cache_key).await {
            Some(raw) => match serde_json::from_str::<InvokeOutcome>(&raw) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(key = %cache_key, error = %e, "Discarding undecodable cache entry");
                    self.shared.cache.delete(&cache_key).await;
                    None
                }
            },
            None => None,
        };
        if let Some(outcome) = cached {
            self.shared.events.emit_cache_hit(cache_key).await;
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(outcome));
            return Ok(PendingOperation { operation_id: Uuid::new_v4(), receiver: rx });
        }
        self.shared.events.emit_cache_miss(cache_key.clone()).await;

        let limits = self.shared.registry.limits_for(agent_name).await;
        let estimate = ResourceEstimate {
            memory_units: limits.budget.base_memory_cost,
            estimated_tokens: Self::estimate_tokens(prompt),
            prompt_length: prompt.len(),
        };
        let operation = Operation::new(agent_name.to_string(), context, estimate);
        let operation_id = operation.id;

        let (tx, rx) = oneshot::channel();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();
        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.config.queue_capacity {
                warn!(
                    capacity = self.config.queue_capacity,
                    agent = %agent_name,
                    "Dispatch queue is full, rejecting"
                );
                return Err(GatewayError::QueueFull { capacity: self.config.queue_capacity });
            }
            self.shared.cancellations.lock().await.insert(operation_id, cancel_token.clone());
            pending.push(PrioritizedEntry(QueuedOperation {
                operation,
                prompt: prompt.to_string(),
                cache_key,
                responder: tx,
                cancel_token,
                sequence,
            }));
        }

        debug!(operation_id = %operation_id, agent = %agent_name, "Enqueued operation");
        Ok(PendingOperation { operation_id, receiver: rx })
    }

    /// Enqueues an invocation and waits for its outcome.
    ///
    /// # Errors
    /// Returns any enqueue, admission, resource, or upstream error.
    pub async fn invoke(
        &self,
        agent_name: &str,
        prompt: &str,
        context: InvokeContext,
    ) -> Result<InvokeOutcome> {
        let pending = self.enqueue(agent_name, prompt, context).await?;
        pending.outcome().await
    }

    /// Requests cancellation of a queued or in-flight operation.
    ///
    /// Queued operations resolve with [`GatewayError::Cancelled`] when the
    /// dispatch loop next reaches them. In-flight operations observe the
    /// cancellation between upstream attempts; an attempt already in flight
    /// runs to its own timeout first.
    ///
    /// # Returns
    /// Returns `true` if the operation was still tracked, `false` if it is
    /// unknown or already finished.
    pub async fn cancel(&self, operation_id: Uuid) -> bool {
        let cancellations = self.shared.cancellations.lock().await;
        match cancellations.get(&operation_id) {
            Some(token) => {
                token.cancel();
                debug!(operation_id = %operation_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Starts the dispatch loop in a background task.
    ///
    /// # Errors
    /// Returns an error if the scheduler is already running.
    pub async fn start(&self) -> std::result::Result<(), String> {
        let mut tx_slot = self.shutdown_tx.lock().await;
        if tx_slot.is_some() {
            return Err("Request scheduler is already running".to_string());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        *tx_slot = Some(shutdown_tx);

        let shared = Arc::clone(&self.shared);
        let pending = Arc::clone(&self.pending);
        let slots = Arc::clone(&self.slots);
        let interval_period = self.config.dispatch_interval();

        tokio::spawn(async move {
            info!("Request scheduler started");

            let mut interval = time::interval(interval_period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Request scheduler shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        // Drain as many ready entries as free slots allow.
                        loop {
                            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                                break;
                            };
                            let entry = { pending.lock().await.pop() };
                            let Some(PrioritizedEntry(entry)) = entry else {
                                break;
                            };
                            if entry.cancel_token.is_cancelled() {
                                debug!(
                                    operation_id = %entry.operation.id,
                                    "Dropping cancelled operation before dispatch"
                                );
                                shared.cancellations.lock().await.remove(&entry.operation.id);
                                shared
                                    .events
                                    .emit_operation_failed(
                                        entry.operation.id,
                                        entry.operation.agent_name.clone(),
                                        GatewayError::Cancelled.to_string(),
                                    )
                                    .await;
                                let _ = entry.responder.send(Err(GatewayError::Cancelled));
                                continue;
                            }
                            debug!(
                                operation_id = %entry.operation.id,
                                priority = %entry.operation.context.priority,
                                "Dispatching operation"
                            );
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                Self::run_operation(shared, entry, permit).await;
                            });
                        }
                    }
                }
            }

            info!("Request scheduler stopped");
        });

        Ok(())
    }

    /// Stops the dispatch loop.
    ///
    /// Queued operations stay in the queue; in-flight operations run to
    /// completion.
    ///
    /// # Errors
    /// Returns an error if the scheduler is not running.
    pub async fn stop(&self) -> std::result::Result<(), String> {
        match self.shutdown_tx.lock().await.take() {
            Some(shutdown_tx) => {
                let _ = shutdown_tx.send(());
                Ok(())
            }
            None => Err("Request scheduler is not running".to_string()),
        }
    }

    /// Checks if the dispatch loop is running.
    pub async fn is_running(&self) -> bool {
        self.shutdown_tx.lock().await.is_some()
    }

    /// Returns the number of queued operations.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Returns the number of operations currently executing.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.config.concurrency - self.slots.available_permits()
    }

    fn estimate_tokens(prompt: &str) -> u32 {
        (prompt.len() / 4) as u32 + COMPLETION_TOKEN_RESERVE
    }

    /// Runs one dispatched operation to completion.
    async fn run_operation(
        shared: Arc<DispatchShared>,
        entry: QueuedOperation,
        permit: OwnedSemaphorePermit,
    ) {
        let _permit = permit;
        let QueuedOperation {
            mut operation,
            prompt,
            cache_key,
            responder,
            cancel_token,
            sequence: _,
        } = entry;
        let started = Instant::now();

        shared
            .events
            .emit_operation_started(operation.id, operation.agent_name.clone())
            .await;

        if let Some(denial) = shared.admission.admit(&operation.agent_name, &operation.context).await
        {
            shared
                .events
                .emit_admission_denied(
                    operation.agent_name.clone(),
                    operation.context.caller_id.clone(),
                    denial.scope.clone(),
                    denial.retry_after,
                )
                .await;
            shared
                .events
                .emit_operation_failed(
                    operation.id,
                    operation.agent_name.clone(),
                    format!("admission denied ({})", denial.scope),
                )
                .await;
            operation.status = OperationStatus::Failed;
            shared.cancellations.lock().await.remove(&operation.id);
            let _ = responder.send(Err(GatewayError::AdmissionDenied {
                scope: denial.scope,
                retry_after: denial.retry_after,
            }));
            return;
        }

        if let Err(e) = shared.governor.reserve(&operation).await {
            shared
                .events
                .emit_operation_failed(operation.id, operation.agent_name.clone(), e.to_string())
                .await;
            operation.status = OperationStatus::Failed;
            shared.cancellations.lock().await.remove(&operation.id);
            let _ = responder.send(Err(e));
            return;
        }
        operation.status = OperationStatus::Reserved;

        let limits = shared.registry.limits_for(&operation.agent_name).await;
        operation.status = OperationStatus::Active;
        let result = Self::execute_with_retries(
            &shared,
            &mut operation,
            &prompt,
            &limits.budget,
            &cancel_token,
            started,
        )
        .await;

        // The completion path and the sweep both attempt release; whoever
        // runs second is a no-op. A failed release means the sweep already
        // reclaimed the operation, and its verdict wins.
        let released = shared.governor.release(operation.id).await;
        let result = if released {
            result
        } else {
            match shared.governor.take_forced(operation.id).await {
                Some(OperationStatus::Cancelled) => Err(GatewayError::Cancelled),
                Some(_) => Err(GatewayError::Timeout { elapsed: started.elapsed() }),
                None => result,
            }
        };

        shared.cancellations.lock().await.remove(&operation.id);
        match result {
            Ok(execution) => {
                operation.status = OperationStatus::Completed;
                let duration_ms = started.elapsed().as_millis() as u64;
                let outcome = InvokeOutcome {
                    content: execution.content,
                    provider: execution.provider_id.clone(),
                    model: execution.model,
                    usage: execution.usage,
                    duration_ms,
                };

                if execution.cacheable {
                    match serde_json::to_string(&outcome) {
                        Ok(serialized) => {
                            shared.cache.set(cache_key, serialized, None).await;
                        }
                        Err(e) => {
                            warn!(
                                operation_id = %operation.id,
                                error = %e,
                                "Failed to serialize outcome for caching"
                            );
                        }
                    }
                }

                shared
                    .events
                    .emit_operation_completed(
                        operation.id,
                        operation.agent_name.clone(),
                        execution.provider_id,
                        duration_ms,
                        u64::from(execution.usage.total_tokens),
                        execution.cost,
                    )
                    .await;
                let _ = responder.send(Ok(outcome));
            }
            Err(e) => {
                operation.status = match e {
                    GatewayError::Timeout { .. } => OperationStatus::TimedOut,
                    GatewayError::Cancelled => OperationStatus::Cancelled,
                    _ => OperationStatus::Failed,
                };
                shared
                    .events
                    .emit_operation_failed(operation.id, operation.agent_name.clone(), e.to_string())
                    .await;
                let _ = responder.send(Err(e));
            }
        }
    }

    /// Executes the upstream call, retrying transient failures with
    /// exponential backoff up to the configured attempt cap.
    ///
    /// Cancellation and the execution-time ceiling are observed between
    /// attempts; each attempt is separately bounded by the breaker's call
    /// timeout, and the governor sweep reclaims anything that overshoots.
    async fn execute_with_retries(
        shared: &DispatchShared,
        operation: &mut Operation,
        prompt: &str,
        budget: &ResourceBudget,
        cancel_token: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult> {
        loop {
            if cancel_token.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if started.elapsed() >= budget.max_execution {
                return Err(GatewayError::Timeout { elapsed: started.elapsed() });
            }

            operation.attempts += 1;
            let attempt = operation.attempts;

            let requirements = RouteRequirements {
                quality: operation.context.quality,
                min_context_tokens: operation.estimate.estimated_tokens,
                ..RouteRequirements::default()
            };
            let selection = match shared
                .router
                .select(&requirements, &operation.context.caller_id, operation.context.tier)
                .await
            {
                Ok(selection) => selection,
                Err(e) => {
                    if e.is_retryable() && attempt < shared.retry.max_attempts {
                        let backoff = shared.retry.backoff_for_attempt(attempt - 1);
                        debug!(
                            operation_id = %operation.id,
                            attempt = attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "No provider available, backing off"
                        );
                        Self::backoff_delay(cancel_token, started, budget.max_execution, backoff)
                            .await?;
                        continue;
                    }
                    return Err(e);
                }
            };

            let provider_id = selection.provider_id.clone();
            shared.balancer.increment_load(&provider_id).await;
            let call_started = Instant::now();

            let provider = Arc::clone(&selection.provider);
            let parameters = GenerationParameters {
                max_tokens: Some(budget.max_tokens),
                ..GenerationParameters::default()
            };
            let fallback = ProviderResponse {
                content: shared.router.degraded_response().to_string(),
                model_id: None,
                usage: None,
            };

            let outcome = shared
                .breakers
                .execute(
                    &provider_id,
                    move || async move { provider.generate(prompt, Some(parameters)).await },
                    move || fallback,
                )
                .await;
            let latency = call_started.elapsed();

            match outcome {
                BreakerOutcome::Success(response) => {
                    shared.balancer.record_outcome(&provider_id, true, latency).await;
                    let usage = response.usage.unwrap_or_default();
                    let cost = shared.router.record_usage(
                        &operation.context.caller_id,
                        &provider_id,
                        &usage,
                    );
                    return Ok(ExecutionResult {
                        content: response.content,
                        provider_id,
                        model: selection.model,
                        usage,
                        cost,
                        cacheable: true,
                    });
                }
                BreakerOutcome::ShortCircuit(response) => {
                    shared.balancer.decrement_load(&provider_id).await;
                    info!(
                        operation_id = %operation.id,
                        provider_id = %provider_id,
                        "Serving degraded response while circuit is open"
                    );
                    return Ok(ExecutionResult {
                        content: response.content,
                        provider_id,
                        model: selection.model,
                        usage: TokenUsage::default(),
                        cost: 0.0,
                        cacheable: false,
                    });
                }
                BreakerOutcome::Failure(provider_error) => {
                    shared.balancer.record_outcome(&provider_id, false, latency).await;
                    shared.router.mark_degraded(&provider_id).await;
                    let err: GatewayError = provider_error.into();
                    if err.is_retryable() && attempt < shared.retry.max_attempts {
                        let backoff = shared.retry.backoff_for_attempt(attempt - 1);
                        warn!(
                            operation_id = %operation.id,
                            provider_id = %provider_id,
                            attempt = attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "Upstream call failed, retrying"
                        );
                        Self::backoff_delay(cancel_token, started, budget.max_execution, backoff)
                            .await?;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Waits out a retry backoff, unless cancellation arrives first or the
    /// wait would cross the operation's execution ceiling.
    async fn backoff_delay(
        cancel_token: &CancellationToken,
        started: Instant,
        ceiling: Duration,
        backoff: Duration,
    ) -> Result<()> {
        if started.elapsed() + backoff >= ceiling {
            return Err(GatewayError::Timeout { elapsed: started.elapsed() });
        }
        tokio::select! {
            () = cancel_token.cancelled() => Err(GatewayError::Cancelled),
            () = time::sleep(backoff) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalancerStrategy;
    use crate::events::GatewayEvent;
    use crate::router::ProviderProfile;
    use crate::types::{CallerTier, Priority, QualityTier};
    use async_trait::async_trait;
    use ballast_abstraction::{Provider, ProviderError};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Provider that fails a configured number of times, then succeeds.
    struct FlakyProvider {
        provider_id: String,
        model_id: String,
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(provider_id: &str, failures: u32) -> Self {
            Self {
                provider_id: provider_id.to_string(),
                model_id: format!("{provider_id}-model"),
                failures_remaining: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn generate(
            &self,
            prompt: &str,
            _parameters: Option<GenerationParameters>,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(ProviderError::ServerError("503 service unavailable".to_string()));
            }
            Ok(ProviderResponse {
                content: format!("response to: {prompt}"),
                model_id: Some(self.model_id.clone()),
                usage: Some(TokenUsage { input_tokens: 10, output_tokens: 20, total_tokens: 30 }),
            })
        }

        fn provider_id(&self) -> &str {
            &self.provider_id
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }
    }

    const BASE_CONFIG: &str = r#"
        [scheduler]
        queue_capacity = 16
        concurrency = 4
        dispatch_interval_ms = 5

        [retry]
        max_attempts = 3
        base_backoff_ms = 10
        max_backoff_ms = 100

        [router]
        strategy = "least-connections"
        degraded_cooldown_ms = 1

        [breaker]
        failure_threshold = 5
        call_timeout_ms = 5000

        [providers.mock-main]
        kind = "mock"
        model = "mock-small"
        cost_per_million_tokens = 1.0
        max_context_tokens = 32768
    "#;

    fn build_scheduler(
        toml_config: &str,
        extra_providers: Vec<ProviderProfile>,
    ) -> (RequestScheduler, EventBus) {
        let config = GatewayConfig::from_toml(toml_config).unwrap();
        let registry = Arc::new(AgentRegistry::from_config(&config));
        let balancer = Arc::new(LoadBalancer::new(
            BalancerStrategy::from_str(&config.router.strategy).unwrap(),
        ));
        let mut router = ProviderRouter::from_config(&config, Arc::clone(&balancer)).unwrap();
        for profile in extra_providers {
            router.register_provider(profile);
        }
        let router = Arc::new(router);
        let admission =
            Arc::new(AdmissionController::in_memory(Arc::clone(&registry), config.admission.clone()));
        let governor =
            Arc::new(ResourceGovernor::new(config.governor.clone(), Arc::clone(&registry)));
        let events = EventBus::new();
        let breakers =
            Arc::new(CircuitBreaker::new(config.breaker.clone()).with_events(events.clone()));
        let cache =
            Arc::new(CacheLayer::in_memory(config.cache.l1_capacity, config.cache.default_ttl()));
        let scheduler = RequestScheduler::new(
            &config,
            registry,
            admission,
            governor,
            router,
            breakers,
            balancer,
            cache,
            events.clone(),
        );
        (scheduler, events)
    }

    fn context() -> InvokeContext {
        InvokeContext {
            caller_id: "caller-1".to_string(),
            tier: CallerTier::Free,
            priority: Priority::Normal,
            quality: QualityTier::Balanced,
            source_address: "10.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let (scheduler, events) = build_scheduler(BASE_CONFIG, Vec::new());
        scheduler.start().await.unwrap();

        let outcome =
            scheduler.invoke("planner", "summarize this report", context()).await.unwrap();
        assert!(outcome.content.contains("summarize this report"));
        assert_eq!(outcome.provider, "mock-main");
        assert_eq!(outcome.model, "mock-small");

        let metrics = events.snapshot().await;
        assert_eq!(metrics.operations_started, 1);
        assert_eq!(metrics.operations_completed, 1);
        assert_eq!(metrics.operations_failed, 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        let config = BASE_CONFIG.replace("concurrency = 4", "concurrency = 1");
        let (scheduler, events) = build_scheduler(&config, Vec::new());
        let mut receiver = events.subscribe();

        // Enqueue before starting so the first tick sees all three.
        let mut low_ctx = context();
        low_ctx.priority = Priority::Low;
        let low = scheduler.enqueue("planner", "low priority work", low_ctx).await.unwrap();

        let mut critical_ctx = context();
        critical_ctx.priority = Priority::Critical;
        let critical =
            scheduler.enqueue("planner", "critical priority work", critical_ctx).await.unwrap();

        let normal = scheduler.enqueue("planner", "normal priority work", context()).await.unwrap();

        scheduler.start().await.unwrap();

        let mut started_order = Vec::new();
        while started_order.len() < 3 {
            if let GatewayEvent::OperationStarted { operation_id, .. } =
                receiver.recv().await.unwrap()
            {
                started_order.push(operation_id);
            }
        }
        assert_eq!(
            started_order,
            vec![critical.operation_id, normal.operation_id, low.operation_id]
        );

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let config = BASE_CONFIG.replace("queue_capacity = 16", "queue_capacity = 2");
        let (scheduler, _events) = build_scheduler(&config, Vec::new());

        // The scheduler is not started, so entries stay queued.
        scheduler.enqueue("planner", "first", context()).await.unwrap();
        scheduler.enqueue("planner", "second", context()).await.unwrap();
        let err = scheduler.enqueue("planner", "third", context()).await.unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull { capacity: 2 }));
        assert_eq!(scheduler.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_admission_denial_reports_retry_after() {
        let config = format!(
            "{BASE_CONFIG}\n[agents.planner]\nper_minute = 1\nper_hour = 100\nper_day = 1000\n"
        );
        let (scheduler, events) = build_scheduler(&config, Vec::new());
        scheduler.start().await.unwrap();

        scheduler.invoke("planner", "first call", context()).await.unwrap();
        let err = scheduler.invoke("planner", "second call", context()).await.unwrap_err();
        match err {
            GatewayError::AdmissionDenied { scope, retry_after } => {
                assert_eq!(scope, "per-minute");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected AdmissionDenied, got {other:?}"),
        }

        let metrics = events.snapshot().await;
        assert_eq!(metrics.admission_denials, 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_resource_denial_is_not_retried() {
        let config = format!(
            "{BASE_CONFIG}\n[agents.planner]\nmax_prompt_length = 16\nper_minute = 100\n"
        );
        let (scheduler, _events) = build_scheduler(&config, Vec::new());
        scheduler.start().await.unwrap();

        let long_prompt = "x".repeat(64);
        let err = scheduler.invoke("planner", &long_prompt, context()).await.unwrap_err();
        match err {
            GatewayError::ResourceDenied { reason } => {
                assert!(reason.contains("Prompt length"), "unexpected reason: {reason}");
            }
            other => panic!("expected ResourceDenied, got {other:?}"),
        }
        assert_eq!(scheduler.shared.governor.usage().await.active_operations, 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        // Sorted candidate order and least-connections tie-breaking keep the
        // flaky provider first, so the retry goes back to it once its
        // degraded cooldown (1ms) has passed.
        let flaky = Arc::new(FlakyProvider::new("flaky", 1));
        let profile = ProviderProfile::new(
            "flaky".to_string(),
            "flaky-model".to_string(),
            1.0,
            false,
            32_768,
            Arc::clone(&flaky) as Arc<dyn Provider + Send + Sync>,
        );
        let (scheduler, _events) = build_scheduler(BASE_CONFIG, vec![profile]);
        scheduler.start().await.unwrap();

        let outcome = scheduler.invoke("planner", "retry me", context()).await.unwrap();
        assert!(outcome.content.contains("retry me"));
        assert_eq!(flaky.call_count(), 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_serves_identical_request() {
        let counting = Arc::new(FlakyProvider::new("counting", 0));
        let profile = ProviderProfile::new(
            "counting".to_string(),
            "counting-model".to_string(),
            1.0,
            false,
            32_768,
            Arc::clone(&counting) as Arc<dyn Provider + Send + Sync>,
        );
        let (scheduler, events) = build_scheduler(BASE_CONFIG, vec![profile]);
        scheduler.start().await.unwrap();

        let first = scheduler.invoke("planner", "cache me", context()).await.unwrap();
        let second = scheduler.invoke("planner", "cache me", context()).await.unwrap();
        assert_eq!(first.content, second.content);
        assert_eq!(second.provider, "counting");
        assert_eq!(counting.call_count(), 1);

        let metrics = events.snapshot().await;
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_operation() {
        let (scheduler, events) = build_scheduler(BASE_CONFIG, Vec::new());

        // Not started yet, so the entry is still queued when the cancel lands.
        let pending = scheduler.enqueue("planner", "doomed work", context()).await.unwrap();
        let operation_id = pending.operation_id;
        assert!(scheduler.cancel(operation_id).await);
        assert!(!scheduler.cancel(Uuid::new_v4()).await);

        scheduler.start().await.unwrap();
        let err = pending.outcome().await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert!(!scheduler.cancel(operation_id).await);

        let metrics = events.snapshot().await;
        assert_eq!(metrics.operations_started, 0);
        assert_eq!(metrics.operations_failed, 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_start_stop() {
        let (scheduler, _events) = build_scheduler(BASE_CONFIG, Vec::new());

        assert!(!scheduler.is_running().await);
        assert!(scheduler.start().await.is_ok());
        assert!(scheduler.is_running().await);
        assert!(scheduler.start().await.is_err());

        assert!(scheduler.stop().await.is_ok());
        assert!(!scheduler.is_running().await);
        assert!(scheduler.stop().await.is_err());
    }

    #[test]
    fn test_priority_entry_ordering() {
        fn entry(priority: Priority, sequence: u64) -> PrioritizedEntry {
            let ctx = InvokeContext { priority, ..InvokeContext::default() };
            let (tx, _rx) = oneshot::channel();
            PrioritizedEntry(QueuedOperation {
                operation: Operation::new("a".to_string(), ctx, ResourceEstimate::default()),
                prompt: String::new(),
                cache_key: String::new(),
                responder: tx,
                cancel_token: CancellationToken::new(),
                sequence,
            })
        }

        let mut heap = BinaryHeap::new();
        heap.push(entry(Priority::Normal, 0));
        heap.push(entry(Priority::Low, 1));
        heap.push(entry(Priority::Critical, 2));
        heap.push(entry(Priority::Normal, 3));

        let order: Vec<(Priority, u64)> = std::iter::from_fn(|| {
            heap.pop().map(|PrioritizedEntry(e)| (e.operation.context.priority, e.sequence))
        })
        .collect();
        assert_eq!(
            order,
            vec![
                (Priority::Critical, 2),
                (Priority::Normal, 0),
                (Priority::Normal, 3),
                (Priority::Low, 1)
            ]
        );
    }
}
