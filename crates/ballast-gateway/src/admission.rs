//! Admission control over sliding request windows.
//!
//! Every request is checked against five scopes before any resources are
//! reserved: per-minute, per-hour, and per-day windows keyed by
//! (agent, caller), a per-minute window keyed by source address, and a short
//! burst window keyed by (agent, caller). A request is admitted only when
//! every scope has room, and is recorded in all scopes only then, so denied
//! requests never consume quota. Check and record run as one serialized
//! transaction per controller, so concurrent arrivals cannot admit past a
//! window limit.
//!
//! The window store is a trait so counts can live in an external store; when
//! it fails the controller admits the request and logs the failure. Losing
//! rate limiting briefly is preferred over refusing traffic.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::registry::{AgentRegistry, RateLimits};
use crate::types::InvokeContext;

/// Errors from the window store.
#[derive(Debug, Error)]
pub enum WindowStoreError {
    /// The backing store could not be reached or rejected the operation.
    #[error("Window store unavailable: {0}")]
    Unavailable(String),
}

/// Sliding-window request log.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drops entries older than `cutoff`, then reports what remains.
    ///
    /// # Returns
    /// Returns the remaining entry count and the oldest remaining timestamp.
    async fn prune_and_count(
        &self,
        key: &str,
        cutoff: SystemTime,
    ) -> Result<(usize, Option<SystemTime>), WindowStoreError>;

    /// Records one request at the given time.
    async fn record(&self, key: &str, at: SystemTime) -> Result<(), WindowStoreError>;
}

/// In-memory window store.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Arc<RwLock<HashMap<String, VecDeque<SystemTime>>>>,
}

impl MemoryWindowStore {
    /// Creates an empty in-memory window store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWindowStore")
            .field("window_count", &self.windows.try_read().map(|w| w.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn prune_and_count(
        &self,
        key: &str,
        cutoff: SystemTime,
    ) -> Result<(usize, Option<SystemTime>), WindowStoreError> {
        let mut windows = self.windows.write().await;
        let Some(entries) = windows.get_mut(key) else {
            return Ok((0, None));
        };
        while entries.front().is_some_and(|t| *t < cutoff) {
            entries.pop_front();
        }
        if entries.is_empty() {
            windows.remove(key);
            return Ok((0, None));
        }
        Ok((entries.len(), entries.front().copied()))
    }

    async fn record(&self, key: &str, at: SystemTime) -> Result<(), WindowStoreError> {
        let mut windows = self.windows.write().await;
        windows.entry(key.to_string()).or_default().push_back(at);
        Ok(())
    }
}

/// A denied admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDenial {
    /// The most restrictive scope that denied.
    pub scope: String,
    /// Suggested wait until the window has room again.
    pub retry_after: Duration,
}

struct ScopeCheck {
    name: &'static str,
    key: String,
    window: Duration,
    limit: u32,
}

/// Admission controller over all request scopes.
pub struct AdmissionController {
    store: Arc<dyn WindowStore>,
    registry: Arc<AgentRegistry>,
    config: AdmissionConfig,
    /// Serializes check-and-record so the two form one transaction.
    gate: Mutex<()>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("burst_limit", &self.config.burst_limit)
            .field("source_per_minute", &self.config.source_per_minute)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Creates an admission controller over the given window store.
    #[must_use]
    pub fn new(
        store: Arc<dyn WindowStore>,
        registry: Arc<AgentRegistry>,
        config: AdmissionConfig,
    ) -> Self {
        Self { store, registry, config, gate: Mutex::new(()) }
    }

    /// Creates an admission controller backed by an in-memory window store.
    #[must_use]
    pub fn in_memory(registry: Arc<AgentRegistry>, config: AdmissionConfig) -> Self {
        Self::new(Arc::new(MemoryWindowStore::new()), registry, config)
    }

    /// Checks every scope and records the request when all admit it.
    ///
    /// When more than one scope is over its limit, the reported denial is the
    /// one whose window takes longest to open up again. Concurrent calls
    /// serialize on an internal gate; a request is counted before the next
    /// one is checked.
    ///
    /// # Arguments
    /// * `agent_name` - Target agent
    /// * `context` - The caller and source of the request
    ///
    /// # Returns
    /// Returns `None` when admitted, or the binding denial.
    pub async fn admit(&self, agent_name: &str, context: &InvokeContext) -> Option<AdmissionDenial> {
        let limits = self.registry.limits_for(agent_name).await;
        let multiplier = context.tier.limit_multiplier();
        let scopes = self.scopes(agent_name, context, limits.rates, multiplier);

        let _gate = self.gate.lock().await;
        let now = SystemTime::now();

        let mut worst: Option<AdmissionDenial> = None;
        for scope in &scopes {
            let cutoff = now - scope.window;
            match self.store.prune_and_count(&scope.key, cutoff).await {
                Ok((count, oldest)) => {
                    if count >= scope.limit as usize {
                        let retry_after = oldest
                            .and_then(|t| now.duration_since(t).ok())
                            .map_or(scope.window, |elapsed| scope.window.saturating_sub(elapsed));
                        let stricter = match &worst {
                            Some(current) => retry_after > current.retry_after,
                            None => true,
                        };
                        if stricter {
                            worst = Some(AdmissionDenial {
                                scope: scope.name.to_string(),
                                retry_after,
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        scope = scope.name,
                        error = %e,
                        "Window store check failed, admitting request"
                    );
                }
            }
        }

        if let Some(denial) = worst {
            debug!(
                agent = %agent_name,
                caller = %context.caller_id,
                scope = %denial.scope,
                retry_after_ms = denial.retry_after.as_millis() as u64,
                "Request denied by admission control"
            );
            return Some(denial);
        }

        for scope in &scopes {
            if let Err(e) = self.store.record(&scope.key, now).await {
                warn!(scope = scope.name, error = %e, "Window store record failed");
            }
        }
        None
    }

    fn scopes(
        &self,
        agent_name: &str,
        context: &InvokeContext,
        rates: RateLimits,
        multiplier: f64,
    ) -> Vec<ScopeCheck> {
        let pair = format!("{}:{}", agent_name, context.caller_id);
        vec![
            ScopeCheck {
                name: "per-minute",
                key: format!("minute:{pair}"),
                window: Duration::from_secs(60),
                limit: scale_limit(rates.per_minute, multiplier),
            },
            ScopeCheck {
                name: "per-hour",
                key: format!("hour:{pair}"),
                window: Duration::from_secs(3_600),
                limit: scale_limit(rates.per_hour, multiplier),
            },
            ScopeCheck {
                name: "per-day",
                key: format!("day:{pair}"),
                window: Duration::from_secs(86_400),
                limit: scale_limit(rates.per_day, multiplier),
            },
            // Address-level protection is caller-independent, so the tier
            // multiplier does not apply.
            ScopeCheck {
                name: "source",
                key: format!("source:{}", context.source_address),
                window: Duration::from_secs(60),
                limit: self.config.source_per_minute,
            },
            ScopeCheck {
                name: "burst",
                key: format!("burst:{pair}"),
                window: self.config.burst_window(),
                limit: scale_limit(self.config.burst_limit, multiplier),
            },
        ]
    }
}

fn scale_limit(limit: u32, multiplier: f64) -> u32 {
    (f64::from(limit) * multiplier).round() as u32
}
