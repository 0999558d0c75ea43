//! Core types for gateway operations.

use ballast_abstraction::TokenUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Dispatch priority for queued operations.
///
/// Ordering follows declaration order, so `Critical` compares greatest and
/// wins the dispatch heap.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work, dispatched last.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Dispatched before everything else.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl Priority {
    /// Converts a string to a Priority.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Caller tier, scaling rate limits and budgets upward for paying tiers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CallerTier {
    /// Unpaid tier, baseline limits.
    #[default]
    Free,
    /// Entry paid tier.
    Standard,
    /// Higher paid tier.
    Premium,
    /// Contract tier with the largest multiplier.
    Enterprise,
}

impl CallerTier {
    /// Multiplier applied to numeric rate limits and budgets before comparison.
    #[must_use]
    pub fn limit_multiplier(self) -> f64 {
        match self {
            CallerTier::Free => 1.0,
            CallerTier::Standard => 1.5,
            CallerTier::Premium => 2.0,
            CallerTier::Enterprise => 4.0,
        }
    }

    /// Converts a string to a CallerTier.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(CallerTier::Free),
            "standard" => Some(CallerTier::Standard),
            "premium" => Some(CallerTier::Premium),
            "enterprise" => Some(CallerTier::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for CallerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerTier::Free => write!(f, "free"),
            CallerTier::Standard => write!(f, "standard"),
            CallerTier::Premium => write!(f, "premium"),
            CallerTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Quality tier requested for a generation, mapping to a provider
/// preference list in configuration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Cheapest capable model, lowest latency.
    Fast,
    /// Default cost/quality balance.
    #[default]
    Balanced,
    /// Highest-capability models.
    Premium,
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::Fast => write!(f, "fast"),
            QualityTier::Balanced => write!(f, "balanced"),
            QualityTier::Premium => write!(f, "premium"),
        }
    }
}

impl QualityTier {
    /// Converts a string to a QualityTier.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Some(QualityTier::Fast),
            "balanced" => Some(QualityTier::Balanced),
            "premium" => Some(QualityTier::Premium),
            _ => None,
        }
    }
}

/// Operation execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting in the dispatch queue.
    Queued,
    /// Resources reserved, upstream call not yet started.
    Reserved,
    /// Upstream call in flight.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Forced out by the execution-time ceiling.
    TimedOut,
    /// Cancelled before completion (caller request or load shedding).
    Cancelled,
}

impl OperationStatus {
    /// Returns `true` for statuses that end an operation's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled)
    }

    /// Checks if the operation can transition to the given status.
    ///
    /// # Arguments
    /// * `to` - The target status
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            // From Queued: reservation, or terminal rejection/cancellation
            (Self::Queued, Self::Reserved | Self::Failed | Self::Cancelled) => true,
            // From Reserved: activation or any terminal status
            (
                Self::Reserved,
                Self::Active | Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled,
            ) => true,
            // From Active: any terminal status, or back to Queued for a retry
            (
                Self::Active,
                Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled | Self::Queued,
            ) => true,
            // Terminal statuses never transition
            _ => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Queued => write!(f, "queued"),
            OperationStatus::Reserved => write!(f, "reserved"),
            OperationStatus::Active => write!(f, "active"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::TimedOut => write!(f, "timed_out"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Reserved resource estimate for one operation.
///
/// These are heuristic units, not measured OS values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// Base memory cost in abstract units.
    pub memory_units: u64,
    /// Estimated token consumption (prompt plus completion).
    pub estimated_tokens: u32,
    /// Prompt length in bytes.
    pub prompt_length: usize,
}

/// Caller-supplied context for an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeContext {
    /// Stable caller identity (user or API key id).
    pub caller_id: String,
    /// Caller tier, scaling limits and budgets.
    pub tier: CallerTier,
    /// Dispatch priority.
    pub priority: Priority,
    /// Requested quality tier.
    pub quality: QualityTier,
    /// Network source address of the request.
    pub source_address: String,
}

/// One tracked request moving through the gateway.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Unique operation id.
    pub id: Uuid,
    /// Target agent name.
    pub agent_name: String,
    /// Caller context captured at enqueue.
    pub context: InvokeContext,
    /// Reserved resource estimate.
    pub estimate: ResourceEstimate,
    /// When the operation entered the queue.
    pub enqueued_at: SystemTime,
    /// Completed dispatch attempts.
    pub attempts: u32,
    /// Current lifecycle status.
    pub status: OperationStatus,
}

impl Operation {
    /// Creates a new queued operation.
    #[must_use]
    pub fn new(agent_name: String, context: InvokeContext, estimate: ResourceEstimate) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_name,
            context,
            estimate,
            enqueued_at: SystemTime::now(),
            attempts: 0,
            status: OperationStatus::Queued,
        }
    }
}

/// Successful result of an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOutcome {
    /// The generated content (or configured degraded fallback content).
    pub content: String,
    /// Provider that served the request.
    pub provider: String,
    /// Model that served the request.
    pub model: String,
    /// Token usage reported by the provider.
    pub usage: TokenUsage,
    /// Wall-clock duration of the operation in milliseconds.
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn tier_multipliers_scale_upward() {
        assert!(CallerTier::Enterprise.limit_multiplier() > CallerTier::Premium.limit_multiplier());
        assert!(CallerTier::Premium.limit_multiplier() > CallerTier::Free.limit_multiplier());
        assert!((CallerTier::Free.limit_multiplier() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in
            [CallerTier::Free, CallerTier::Standard, CallerTier::Premium, CallerTier::Enterprise]
        {
            assert_eq!(CallerTier::from_str(&tier.to_string()), Some(tier));
        }
        assert_eq!(CallerTier::from_str("platinum"), None);
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(OperationStatus::Queued.can_transition_to(OperationStatus::Reserved));
        assert!(OperationStatus::Reserved.can_transition_to(OperationStatus::Active));
        assert!(OperationStatus::Active.can_transition_to(OperationStatus::Completed));
        assert!(OperationStatus::Active.can_transition_to(OperationStatus::Queued));
        assert!(!OperationStatus::Completed.can_transition_to(OperationStatus::Active));
        assert!(!OperationStatus::Queued.can_transition_to(OperationStatus::Active));
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::TimedOut.is_terminal());
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Active.is_terminal());
    }

    #[test]
    fn operation_starts_queued_with_zero_attempts() {
        let op = Operation::new(
            "planner".to_string(),
            InvokeContext::default(),
            ResourceEstimate::default(),
        );
        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(op.attempts, 0);
    }
}
