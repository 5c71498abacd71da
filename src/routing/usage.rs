//! Usage and spend counters.
//!
//! Tracks per-tier request counts, token volume and estimated spend, plus
//! rejections, and reports savings against the best-quality baseline.
//!
//! Thread-safe: all counters use atomic operations for lock-free reads
//! and writes under concurrent request handling.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::estimator::micros_to_usd;
use super::router::{DecisionReason, RoutingDecision};
use super::tier::TierId;

#[derive(Debug, Default)]
struct TierCounters {
    requests: AtomicU64,
    tokens: AtomicU64,
    spend_micros: AtomicU64,
}

/// Lock-free usage tracker.
///
/// Costs are stored as micro-dollars (1 USD = 1 000 000 micro-dollars) to
/// avoid floating-point drift in long-running aggregations.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Default)]
pub struct UsageTracker {
    tiers: [TierCounters; 3],
    baseline_micros: AtomicU64,
    cache_hits: AtomicU64,
    over_budget: AtomicU64,
    rejected_budget: AtomicU64,
    rejected_invalid: AtomicU64,
    rejected_unavailable: AtomicU64,
}

/// Per-tier slice of a [`UsageSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierUsage {
    /// Tier.
    pub tier: TierId,
    /// Decisions routed here.
    pub requests: u64,
    /// Estimated tokens routed here.
    pub tokens: u64,
    /// Estimated spend in USD.
    pub spend_usd: f64,
}

/// Point-in-time snapshot of usage counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    /// One row per tier.
    pub tiers: Vec<TierUsage>,
    /// Admitted decisions.
    pub total_requests: u64,
    /// Total estimated spend in USD.
    pub total_cost_usd: f64,
    /// Spend had every request gone to its best-quality tier, in USD.
    pub baseline_cost_usd: f64,
    /// `baseline - actual`, floored at zero.
    pub savings_usd: f64,
    /// Decisions served from the cache.
    pub cache_hits: u64,
    /// `performance` decisions admitted over budget.
    pub over_budget_decisions: u64,
    /// Requests refused with `BudgetExceeded`.
    pub rejected_budget: u64,
    /// Requests refused as malformed or with an unknown mode.
    pub rejected_invalid: u64,
    /// Requests refused with `TierUnavailable`.
    pub rejected_unavailable: u64,
}

impl UsageTracker {
    /// Create a tracker with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted decision.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record_decision(&self, decision: &RoutingDecision) {
        let tier = &self.tiers[decision.tier.index()];
        tier.requests.fetch_add(1, Ordering::Relaxed);
        tier.tokens.fetch_add(
            decision.input_tokens.saturating_add(decision.output_tokens),
            Ordering::Relaxed,
        );
        tier.spend_micros
            .fetch_add(decision.estimated_cost_micros, Ordering::Relaxed);
        self.baseline_micros
            .fetch_add(decision.baseline_cost_micros, Ordering::Relaxed);
        if decision.reason == DecisionReason::CacheHit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if decision.over_budget {
            self.over_budget.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a refusal by its error code.
    pub fn record_rejection(&self, error: &crate::RouterError) {
        let counter = match error {
            crate::RouterError::BudgetExceeded { .. } => &self.rejected_budget,
            crate::RouterError::TierUnavailable(_) => &self.rejected_unavailable,
            _ => &self.rejected_invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of current counters.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn snapshot(&self) -> UsageSnapshot {
        let mut total_requests = 0u64;
        let mut actual = 0u64;
        let tiers: Vec<TierUsage> = TierId::ALL
            .iter()
            .map(|&id| {
                let c = &self.tiers[id.index()];
                let requests = c.requests.load(Ordering::Relaxed);
                let spend = c.spend_micros.load(Ordering::Relaxed);
                total_requests += requests;
                actual = actual.saturating_add(spend);
                TierUsage {
                    tier: id,
                    requests,
                    tokens: c.tokens.load(Ordering::Relaxed),
                    spend_usd: micros_to_usd(spend),
                }
            })
            .collect();
        let baseline = self.baseline_micros.load(Ordering::Relaxed);

        UsageSnapshot {
            tiers,
            total_requests,
            total_cost_usd: micros_to_usd(actual),
            baseline_cost_usd: micros_to_usd(baseline),
            savings_usd: micros_to_usd(baseline.saturating_sub(actual)),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            over_budget_decisions: self.over_budget.load(Ordering::Relaxed),
            rejected_budget: self.rejected_budget.load(Ordering::Relaxed),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
            rejected_unavailable: self.rejected_unavailable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ledger::PeriodKind;
    use crate::routing::router::{EconomicMode, TaskType};
    use crate::RouterError;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn decision(tier: TierId, cost: u64, baseline: u64, reason: DecisionReason) -> RoutingDecision {
        RoutingDecision {
            id: Uuid::new_v4(),
            owner: "t".into(),
            tier,
            mode: EconomicMode::Balanced,
            task_type: TaskType::General,
            input_tokens: 10,
            output_tokens: 5,
            estimated_cost_micros: cost,
            baseline_cost_micros: baseline,
            decision_latency: Duration::from_micros(3),
            reason,
            over_budget: false,
            binding_period: PeriodKind::Daily,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_tracker_all_counters_zero() {
        let s = UsageTracker::new().snapshot();
        assert_eq!(s.total_requests, 0);
        assert_eq!(s.tiers.len(), 3);
        assert!(s.total_cost_usd.abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_decision_accumulates_per_tier() {
        let t = UsageTracker::new();
        t.record_decision(&decision(TierId::Elastic, 2_000, 18_000, DecisionReason::BestQualityWithinBudget));
        t.record_decision(&decision(TierId::Elastic, 2_000, 18_000, DecisionReason::BestQualityWithinBudget));
        t.record_decision(&decision(TierId::Premium, 18_000, 18_000, DecisionReason::PerformancePreferred));
        let s = t.snapshot();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.tiers[1].requests, 2);
        assert_eq!(s.tiers[1].tokens, 30);
        assert!((s.total_cost_usd - 0.022).abs() < 1e-9);
        assert!((s.savings_usd - 0.032).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hits_counted() {
        let t = UsageTracker::new();
        t.record_decision(&decision(TierId::Local, 0, 0, DecisionReason::CacheHit));
        assert_eq!(t.snapshot().cache_hits, 1);
    }

    #[test]
    fn test_rejections_bucketed_by_kind() {
        let t = UsageTracker::new();
        t.record_rejection(&RouterError::BudgetExceeded {
            owner: "a".into(),
            period: PeriodKind::Daily,
            required_usd: 1.0,
            remaining_usd: 0.0,
        });
        t.record_rejection(&RouterError::InvalidMode("x".into()));
        t.record_rejection(&RouterError::Estimation("x".into()));
        let s = t.snapshot();
        assert_eq!(s.rejected_budget, 1);
        assert_eq!(s.rejected_invalid, 2);
        assert_eq!(s.rejected_unavailable, 0);
    }
}
