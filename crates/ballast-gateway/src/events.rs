//! Event broadcasting for gateway observers.
//!
//! Components emit lifecycle events over a broadcast channel; subscribers
//! receive them one-way and cannot influence request handling. The bus also
//! folds every event into a running metrics snapshot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Gateway lifecycle event types.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// An operation left the queue and entered the admission pipeline.
    OperationStarted {
        /// Operation ID.
        operation_id: Uuid,
        /// Agent name.
        agent_name: String,
    },
    /// An operation completed successfully.
    OperationCompleted {
        /// Operation ID.
        operation_id: Uuid,
        /// Agent name.
        agent_name: String,
        /// Provider that served the request.
        provider_id: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// An operation failed terminally.
    OperationFailed {
        /// Operation ID.
        operation_id: Uuid,
        /// Agent name.
        agent_name: String,
        /// Error message.
        error: String,
    },
    /// A circuit transitioned to open for a target.
    CircuitOpened {
        /// Breaker target.
        target: String,
    },
    /// A circuit recovered to closed for a target.
    CircuitClosed {
        /// Breaker target.
        target: String,
    },
    /// A request was denied by admission control.
    AdmissionDenied {
        /// Agent name.
        agent_name: String,
        /// Caller identity.
        caller_id: String,
        /// The most restrictive scope that denied.
        scope: String,
        /// Suggested wait before retrying, in milliseconds.
        retry_after_ms: u64,
    },
    /// A result was served from cache.
    CacheHit {
        /// Cache key.
        key: String,
    },
    /// A lookup missed the cache.
    CacheMiss {
        /// Cache key.
        key: String,
    },
}

/// Gateway metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct GatewayMetrics {
    /// Operations that entered the pipeline.
    pub operations_started: u64,
    /// Operations that completed successfully.
    pub operations_completed: u64,
    /// Operations that failed terminally.
    pub operations_failed: u64,
    /// Requests denied by admission control.
    pub admission_denials: u64,
    /// Circuit open transitions.
    pub circuit_opens: u64,
    /// Circuit close transitions.
    pub circuit_closes: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Total tokens consumed upstream.
    pub total_tokens: u64,
    /// Total spend in USD.
    pub total_cost: f64,
}

/// Broadcast bus for gateway events.
#[derive(Clone)]
pub struct EventBus {
    /// Broadcast sender for gateway events.
    broadcast_tx: broadcast::Sender<GatewayEvent>,
    /// Current metrics.
    metrics: Arc<Mutex<GatewayMetrics>>,
}

impl EventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(100);
        Self {
            broadcast_tx,
            metrics: Arc::new(Mutex::new(GatewayMetrics::default())),
        }
    }

    /// Subscribes to gateway events.
    ///
    /// # Returns
    /// Returns a receiver for gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Gets the current metrics snapshot.
    ///
    /// # Returns
    /// Returns a copy of the current metrics.
    pub async fn snapshot(&self) -> GatewayMetrics {
        self.metrics.lock().await.clone()
    }

    /// Emits an operation started event.
    pub async fn emit_operation_started(&self, operation_id: Uuid, agent_name: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.operations_started += 1;
        }

        let event = GatewayEvent::OperationStarted { operation_id, agent_name };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits an operation completed event and folds usage into the metrics.
    ///
    /// # Arguments
    /// * `operation_id` - Operation ID
    /// * `agent_name` - Agent name
    /// * `provider_id` - Provider that served the request
    /// * `duration_ms` - Wall-clock duration in milliseconds
    /// * `tokens` - Total tokens consumed
    /// * `cost` - Spend in USD
    pub async fn emit_operation_completed(
        &self,
        operation_id: Uuid,
        agent_name: String,
        provider_id: String,
        duration_ms: u64,
        tokens: u64,
        cost: f64,
    ) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.operations_completed += 1;
            metrics.total_tokens += tokens;
            metrics.total_cost += cost;
        }

        let event = GatewayEvent::OperationCompleted {
            operation_id,
            agent_name,
            provider_id,
            duration_ms,
        };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits an operation failed event.
    pub async fn emit_operation_failed(
        &self,
        operation_id: Uuid,
        agent_name: String,
        error: String,
    ) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.operations_failed += 1;
        }

        let event = GatewayEvent::OperationFailed { operation_id, agent_name, error };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits a circuit opened event.
    pub async fn emit_circuit_opened(&self, target: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.circuit_opens += 1;
        }

        let event = GatewayEvent::CircuitOpened { target };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits a circuit closed event.
    pub async fn emit_circuit_closed(&self, target: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.circuit_closes += 1;
        }

        let event = GatewayEvent::CircuitClosed { target };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits an admission denied event.
    pub async fn emit_admission_denied(
        &self,
        agent_name: String,
        caller_id: String,
        scope: String,
        retry_after: Duration,
    ) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.admission_denials += 1;
        }

        let event = GatewayEvent::AdmissionDenied {
            agent_name,
            caller_id,
            scope,
            retry_after_ms: retry_after.as_millis() as u64,
        };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits a cache hit event.
    pub async fn emit_cache_hit(&self, key: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.cache_hits += 1;
        }

        let event = GatewayEvent::CacheHit { key };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }

    /// Emits a cache miss event.
    pub async fn emit_cache_miss(&self, key: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.cache_misses += 1;
        }

        let event = GatewayEvent::CacheMiss { key };
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Gateway event: {:?}", event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
