//! Load balancing across equally ranked providers.
//!
//! The router narrows candidates by capability and health; the balancer
//! spreads traffic over what remains. All strategies share one set of
//! per-target counters fed by the dispatch pipeline.

use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Weight floor so no candidate is ever fully starved.
const MIN_WEIGHT: f64 = 0.01;

/// Strategy for distributing calls across candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerStrategy {
    /// Rotate through candidates in order, one cursor per scope.
    RoundRobin,
    /// Pick the candidate with the fewest calls in flight.
    LeastConnections,
    /// Weighted random draw favoring healthy, fast, idle candidates.
    Weighted,
}

impl fmt::Display for BalancerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerStrategy::RoundRobin => write!(f, "round-robin"),
            BalancerStrategy::LeastConnections => write!(f, "least-connections"),
            BalancerStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

impl BalancerStrategy {
    /// Converts a string to a BalancerStrategy.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" => Some(BalancerStrategy::RoundRobin),
            "least-connections" | "least_connections" => Some(BalancerStrategy::LeastConnections),
            "weighted" => Some(BalancerStrategy::Weighted),
            _ => None,
        }
    }
}

/// Per-target counters.
#[derive(Debug, Clone, Copy, Default)]
struct TargetStats {
    in_flight: usize,
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
    samples: u64,
}

impl TargetStats {
    fn error_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.failures as f64 / self.samples as f64
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.samples as f64
        }
    }
}

/// Load balancer over provider targets.
pub struct LoadBalancer {
    /// Configured balancing strategy.
    strategy: BalancerStrategy,
    /// Round-robin cursor per scope.
    rotation: Arc<Mutex<HashMap<String, usize>>>,
    /// Call counters per target.
    stats: Arc<Mutex<HashMap<String, TargetStats>>>,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer").field("strategy", &self.strategy).finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Creates a new load balancer.
    ///
    /// # Arguments
    /// * `strategy` - Strategy used to pick among candidates
    #[must_use]
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self {
            strategy,
            rotation: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the configured strategy.
    #[must_use]
    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Picks one candidate according to the configured strategy.
    ///
    /// # Arguments
    /// * `scope` - Rotation scope, usually the quality tier
    /// * `candidates` - Targets to choose from, in preference order
    ///
    /// # Returns
    /// Returns `Some(target)` when candidates is non-empty, `None` otherwise.
    pub async fn pick(&self, scope: &str, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }

        match self.strategy {
            BalancerStrategy::RoundRobin => self.pick_round_robin(scope, candidates).await,
            BalancerStrategy::LeastConnections => self.pick_least_connections(candidates).await,
            BalancerStrategy::Weighted => self.pick_weighted(candidates).await,
        }
    }

    /// Increments the in-flight count for a target.
    pub async fn increment_load(&self, target: &str) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(target.to_string()).or_default();
        entry.in_flight += 1;
        debug!(target = %target, load = entry.in_flight, "Incremented target load");
    }

    /// Decrements the in-flight count for a target without recording an
    /// outcome sample. Used when a call was admitted but never reached the
    /// provider.
    pub async fn decrement_load(&self, target: &str) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(target.to_string()).or_default();
        if entry.in_flight > 0 {
            entry.in_flight -= 1;
            debug!(target = %target, load = entry.in_flight, "Decremented target load");
        } else {
            warn!(target = %target, "Attempted to decrement load below zero");
        }
    }

    /// Records the outcome of a dispatched call and releases its slot.
    ///
    /// # Arguments
    /// * `target` - The target the call went to
    /// * `success` - Whether the call succeeded
    /// * `latency` - Wall-clock call duration
    pub async fn record_outcome(&self, target: &str, success: bool, latency: Duration) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(target.to_string()).or_default();

        if entry.in_flight > 0 {
            entry.in_flight -= 1;
        } else {
            warn!(target = %target, "Attempted to decrement load below zero");
        }

        entry.samples += 1;
        entry.total_latency_ms += latency.as_millis() as u64;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }

        debug!(
            target = %target,
            load = entry.in_flight,
            success = success,
            latency_ms = latency.as_millis() as u64,
            "Recorded call outcome"
        );
    }

    /// Gets the current in-flight count for a target.
    pub async fn current_load(&self, target: &str) -> usize {
        let stats = self.stats.lock().await;
        stats.get(target).map_or(0, |s| s.in_flight)
    }

    async fn pick_round_robin(&self, scope: &str, candidates: &[String]) -> Option<String> {
        let mut rotation = self.rotation.lock().await;
        let cursor = rotation.entry(scope.to_string()).or_insert(0);
        let index = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        Some(candidates[index].clone())
    }

    async fn pick_least_connections(&self, candidates: &[String]) -> Option<String> {
        let stats = self.stats.lock().await;

        let mut best: Option<(&String, usize)> = None;
        for target in candidates {
            let load = stats.get(target).map_or(0, |s| s.in_flight);
            match best {
                None => best = Some((target, load)),
                Some((_, best_load)) if load < best_load => best = Some((target, load)),
                _ => {}
            }
        }

        best.map(|(target, _)| target.clone())
    }

    async fn pick_weighted(&self, candidates: &[String]) -> Option<String> {
        let weights = {
            let stats = self.stats.lock().await;

            let mut max_latency = 0.0_f64;
            let mut max_load = 0_usize;
            for target in candidates {
                if let Some(s) = stats.get(target) {
                    max_latency = max_latency.max(s.average_latency_ms());
                    max_load = max_load.max(s.in_flight);
                }
            }

            candidates
                .iter()
                .map(|target| {
                    let (error_rate, latency, load) = stats
                        .get(target)
                        .map_or((0.0, 0.0, 0), |s| {
                            (s.error_rate(), s.average_latency_ms(), s.in_flight)
                        });
                    let norm_latency = if max_latency > 0.0 { latency / max_latency } else { 0.0 };
                    let norm_load =
                        if max_load > 0 { load as f64 / max_load as f64 } else { 0.0 };
                    ((1.0 - error_rate) * (1.0 - norm_latency) * (1.0 - norm_load))
                        .max(MIN_WEIGHT)
                })
                .collect::<Vec<f64>>()
        };

        let total: f64 = weights.iter().sum();
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        for (target, weight) in candidates.iter().zip(&weights) {
            draw -= weight;
            if draw <= 0.0 {
                return Some(target.clone());
            }
        }
        candidates.last().cloned()
    }
}
