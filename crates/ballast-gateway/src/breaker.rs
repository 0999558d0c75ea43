//! Per-target circuit breakers.
//!
//! Each upstream target gets its own breaker, created lazily on first use.
//! A circuit opens after a run of consecutive failures or when the error
//! rate over a trailing window crosses the threshold, and recovers through
//! a half-open phase that admits a limited number of trial calls. While a
//! circuit is open, callers receive the supplied fallback instead of an
//! upstream invocation.
//!
//! Every call runs under the breaker's own timeout so a hung upstream is
//! recorded as a failure instead of occupying a slot until the operation's
//! execution ceiling.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ballast_abstraction::ProviderError;

use crate::config::BreakerConfig;
use crate::events::EventBus;

/// Circuit state for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through and outcomes are recorded.
    Closed,
    /// Calls are rejected until the recovery time passes.
    Open {
        /// When the circuit becomes eligible for trial calls.
        until: SystemTime,
    },
    /// A limited number of trial calls probe the target.
    HalfOpen,
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum BreakerOutcome<T> {
    /// The call went through and succeeded.
    Success(T),
    /// The circuit rejected the call; the fallback was served without any
    /// upstream invocation.
    ShortCircuit(T),
    /// The call went through and failed or timed out.
    Failure(ProviderError),
}

struct TargetBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    /// Trailing (time, success) samples inside the configured window.
    outcomes: VecDeque<(SystemTime, bool)>,
    half_open_trials: u32,
}

impl TargetBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            outcomes: VecDeque::new(),
            half_open_trials: 0,
        }
    }

    fn prune(&mut self, cutoff: SystemTime) {
        while self.outcomes.front().is_some_and(|(t, _)| *t < cutoff) {
            self.outcomes.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, success)| !success).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Circuit breakers keyed by target, sharing one configuration.
pub struct CircuitBreaker {
    targets: Arc<RwLock<HashMap<String, TargetBreaker>>>,
    config: BreakerConfig,
    events: Option<EventBus>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target_count", &self.targets.try_read().map(|t| t.len()).unwrap_or(0))
            .field("failure_threshold", &self.config.failure_threshold)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker registry with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self { targets: Arc::new(RwLock::new(HashMap::new())), config, events: None }
    }

    /// Attaches an event bus for circuit transition events.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs a call through the target's breaker.
    ///
    /// The call runs under the breaker's own timeout; an elapsed timeout is
    /// recorded as a failure. When the circuit rejects the call, the fallback
    /// is evaluated instead and no upstream invocation happens.
    ///
    /// # Arguments
    /// * `target` - Breaker key, usually a provider id
    /// * `call` - The guarded upstream call
    /// * `fallback` - Produces the degraded result for a rejected call
    pub async fn execute<T, F, Fut, B>(&self, target: &str, call: F, fallback: B) -> BreakerOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        B: FnOnce() -> T,
    {
        if !self.try_acquire(target).await {
            debug!(target = %target, "Circuit open, serving fallback");
            return BreakerOutcome::ShortCircuit(fallback());
        }

        match tokio::time::timeout(self.config.call_timeout(), call()).await {
            Ok(Ok(value)) => {
                self.record_success(target).await;
                BreakerOutcome::Success(value)
            }
            Ok(Err(e)) => {
                self.record_failure(target).await;
                BreakerOutcome::Failure(e)
            }
            Err(_) => {
                self.record_failure(target).await;
                BreakerOutcome::Failure(ProviderError::Timeout(format!(
                    "Call to '{}' exceeded {}ms",
                    target, self.config.call_timeout_ms
                )))
            }
        }
    }

    /// Returns the current circuit state for a target, if one exists yet.
    pub async fn state(&self, target: &str) -> Option<CircuitState> {
        let targets = self.targets.read().await;
        targets.get(target).map(|t| t.state)
    }

    /// Decides whether a call may proceed, handling the open-to-half-open
    /// transition and the half-open trial budget.
    async fn try_acquire(&self, target: &str) -> bool {
        let now = SystemTime::now();
        let mut targets = self.targets.write().await;
        let breaker = targets.entry(target.to_string()).or_insert_with(TargetBreaker::new);

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } => {
                if now >= until {
                    info!(target = %target, "Circuit half-open, admitting trial call");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.half_open_trials = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_trials < self.config.half_open_max_trials {
                    breaker.half_open_trials += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self, target: &str) {
        let closed = {
            let now = SystemTime::now();
            let mut targets = self.targets.write().await;
            let breaker = targets.entry(target.to_string()).or_insert_with(TargetBreaker::new);

            breaker.consecutive_failures = 0;
            breaker.outcomes.push_back((now, true));
            breaker.prune(now - self.config.window());

            if breaker.state == CircuitState::HalfOpen {
                breaker.state = CircuitState::Closed;
                breaker.half_open_trials = 0;
                breaker.outcomes.clear();
                true
            } else {
                false
            }
        };

        if closed {
            info!(target = %target, "Circuit closed after successful trial");
            if let Some(events) = &self.events {
                events.emit_circuit_closed(target.to_string()).await;
            }
        }
    }

    async fn record_failure(&self, target: &str) {
        let opened = {
            let now = SystemTime::now();
            let mut targets = self.targets.write().await;
            let breaker = targets.entry(target.to_string()).or_insert_with(TargetBreaker::new);

            breaker.consecutive_failures += 1;
            breaker.outcomes.push_back((now, false));
            breaker.prune(now - self.config.window());

            match breaker.state {
                CircuitState::HalfOpen => {
                    breaker.state =
                        CircuitState::Open { until: now + self.config.recovery_timeout() };
                    true
                }
                CircuitState::Closed => {
                    let runaway = breaker.consecutive_failures >= self.config.failure_threshold;
                    let rate_tripped = breaker.outcomes.len() >= self.config.min_samples
                        && breaker.failure_rate() >= self.config.error_rate_threshold;
                    if runaway || rate_tripped {
                        breaker.state =
                            CircuitState::Open { until: now + self.config.recovery_timeout() };
                        true
                    } else {
                        false
                    }
                }
                CircuitState::Open { .. } => false,
            }
        };

        if opened {
            warn!(target = %target, "Circuit opened");
            if let Some(events) = &self.events {
                events.emit_circuit_opened(target.to_string()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GatewayEvent;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(failure_threshold: u32, recovery_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            error_rate_threshold: 0.99,
            window_secs: 300,
            min_samples: 1_000,
            recovery_timeout_ms: recovery_ms,
            half_open_max_trials: 2,
            call_timeout_ms: 1_000,
        }
    }

    async fn fail(breaker: &CircuitBreaker, target: &str) -> BreakerOutcome<String> {
        breaker
            .execute(
                target,
                || async { Err(ProviderError::ServerError("boom".to_string())) },
                || "fallback".to_string(),
            )
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, target: &str) -> BreakerOutcome<String> {
        breaker
            .execute(
                target,
                || async { Ok("ok".to_string()) },
                || "fallback".to_string(),
            )
            .await
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(config(3, 60_000));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let outcome = breaker
                .execute(
                    "gemini",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<String, _>(ProviderError::ServerError("boom".to_string()))
                    },
                    || "fallback".to_string(),
                )
                .await;
            assert!(matches!(outcome, BreakerOutcome::Failure(_)));
        }
        assert!(matches!(breaker.state("gemini").await, Some(CircuitState::Open { .. })));

        // Subsequent calls serve the fallback with no upstream invocation.
        for _ in 0..2 {
            let outcome = breaker
                .execute(
                    "gemini",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<String, _>(ProviderError::ServerError("boom".to_string()))
                    },
                    || "fallback".to_string(),
                )
                .await;
            match outcome {
                BreakerOutcome::ShortCircuit(content) => assert_eq!(content, "fallback"),
                other => panic!("expected short circuit, got {other:?}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(config(3, 60_000));

        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));
        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));
        assert!(matches!(succeed(&breaker, "t").await, BreakerOutcome::Success(_)));
        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));
        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));

        assert_eq!(breaker.state("t").await, Some(CircuitState::Closed));

        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));
        assert!(matches!(breaker.state("t").await, Some(CircuitState::Open { .. })));
    }

    #[tokio::test]
    async fn test_error_rate_trips_with_mixed_outcomes() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 100,
            error_rate_threshold: 0.5,
            window_secs: 300,
            min_samples: 4,
            recovery_timeout_ms: 60_000,
            half_open_max_trials: 2,
            call_timeout_ms: 1_000,
        });

        succeed(&breaker, "t").await;
        fail(&breaker, "t").await;
        succeed(&breaker, "t").await;
        assert_eq!(breaker.state("t").await, Some(CircuitState::Closed));

        // Fourth sample reaches min_samples with a 50% failure rate.
        fail(&breaker, "t").await;
        assert!(matches!(breaker.state("t").await, Some(CircuitState::Open { .. })));
    }

    #[tokio::test]
    async fn test_recovers_through_half_open_success() {
        let breaker = CircuitBreaker::new(config(1, 20));

        fail(&breaker, "t").await;
        assert!(matches!(breaker.state("t").await, Some(CircuitState::Open { .. })));
        assert!(matches!(succeed(&breaker, "t").await, BreakerOutcome::ShortCircuit(_)));

        tokio::time::sleep(Duration::from_millis(40)).await;

        // First call after recovery is a trial; its success closes the circuit.
        assert!(matches!(succeed(&breaker, "t").await, BreakerOutcome::Success(_)));
        assert_eq!(breaker.state("t").await, Some(CircuitState::Closed));
        assert!(matches!(succeed(&breaker, "t").await, BreakerOutcome::Success(_)));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config(1, 20));

        fail(&breaker, "t").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(fail(&breaker, "t").await, BreakerOutcome::Failure(_)));
        assert!(matches!(breaker.state("t").await, Some(CircuitState::Open { .. })));
        assert!(matches!(succeed(&breaker, "t").await, BreakerOutcome::ShortCircuit(_)));
    }

    #[tokio::test]
    async fn test_half_open_trial_budget_rejects_extra_calls() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            error_rate_threshold: 0.99,
            window_secs: 300,
            min_samples: 1_000,
            recovery_timeout_ms: 20,
            half_open_max_trials: 1,
            call_timeout_ms: 1_000,
        });

        fail(&breaker, "t").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The first call occupies the single trial slot while the second
        // arrives concurrently and is rejected.
        let slow_trial = breaker.execute(
            "t",
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ProviderError>("ok".to_string())
            },
            || "fallback".to_string(),
        );
        let concurrent = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            succeed(&breaker, "t").await
        };

        let (trial_outcome, concurrent_outcome) = tokio::join!(slow_trial, concurrent);
        assert!(matches!(trial_outcome, BreakerOutcome::Success(_)));
        assert!(matches!(concurrent_outcome, BreakerOutcome::ShortCircuit(_)));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            error_rate_threshold: 0.99,
            window_secs: 300,
            min_samples: 1_000,
            recovery_timeout_ms: 60_000,
            half_open_max_trials: 2,
            call_timeout_ms: 20,
        });

        let outcome = breaker
            .execute(
                "t",
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ProviderError>("late".to_string())
                },
                || "fallback".to_string(),
            )
            .await;
        assert!(matches!(outcome, BreakerOutcome::Failure(ProviderError::Timeout(_))));
        assert!(matches!(breaker.state("t").await, Some(CircuitState::Open { .. })));
    }

    #[tokio::test]
    async fn test_targets_are_isolated() {
        let breaker = CircuitBreaker::new(config(1, 60_000));

        fail(&breaker, "gemini").await;
        assert!(matches!(breaker.state("gemini").await, Some(CircuitState::Open { .. })));

        assert!(matches!(succeed(&breaker, "openai").await, BreakerOutcome::Success(_)));
        assert_eq!(breaker.state("openai").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_transition_events_are_emitted() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let breaker = CircuitBreaker::new(config(1, 20)).with_events(events);

        fail(&breaker, "gemini").await;
        match rx.recv().await.unwrap() {
            GatewayEvent::CircuitOpened { target } => assert_eq!(target, "gemini"),
            other => panic!("unexpected event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        succeed(&breaker, "gemini").await;
        match rx.recv().await.unwrap() {
            GatewayEvent::CircuitClosed { target } => assert_eq!(target, "gemini"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
