//! Tier selection.
//!
//! The [`TierRouter`] is stateless per call: given a request, the owner's
//! budget snapshot and the live tunables it prices every configured tier,
//! orders the candidates for the requested [`EconomicMode`] and returns the
//! first one that is available and fits the binding budget.
//!
//! It never touches the ledger. The caller runs it inside
//! [`BudgetLedger::admit`](super::ledger::BudgetLedger::admit) so the
//! decision and the debit are one atomic step.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::estimator::{apply_batch_discount, estimate_cost, micros_to_usd, TokenEstimate};
use super::ledger::{BudgetSnapshot, PeriodKind};
use super::tier::{Tier, TierId, TierRegistry};
use super::tunables::RouterTunables;
use crate::RouterError;

// ── Request vocabulary ─────────────────────────────────────────────────

/// How aggressively cost is weighed against quality.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EconomicMode {
    /// Cheapest tier that fits.
    CostOptimized,
    /// Best quality among tiers that use at most a fraction of the budget.
    #[default]
    Balanced,
    /// Best quality; budget is a soft constraint.
    Performance,
}

impl EconomicMode {
    /// All modes.
    pub const ALL: [EconomicMode; 3] = [
        EconomicMode::CostOptimized,
        EconomicMode::Balanced,
        EconomicMode::Performance,
    ];

    /// Wire name.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CostOptimized => "cost_optimized",
            Self::Balanced => "balanced",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for EconomicMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EconomicMode {
    type Err = RouterError;

    /// Exact match against the wire names. Anything else is
    /// [`RouterError::InvalidMode`]; there is no fallback to a default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost_optimized" => Ok(Self::CostOptimized),
            "balanced" => Ok(Self::Balanced),
            "performance" => Ok(Self::Performance),
            other => Err(RouterError::InvalidMode(other.to_string())),
        }
    }
}

/// Declared kind of work. Only reorders candidates, never removes one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Short, low-stakes work; balanced mode goes cheapest-first.
    Simple,
    /// Anything else.
    #[default]
    General,
    /// Reasoning-heavy work.
    Complex,
}

impl TaskType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::General => "general",
            Self::Complex => "complex",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "general" => Ok(Self::General),
            "complex" => Ok(Self::Complex),
            other => Err(RouterError::Estimation(format!(
                "unknown task_type '{other}' (expected simple, general or complex)"
            ))),
        }
    }
}

/// One unit of routable work, after estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    /// Project whose budget pays for the request.
    pub owner: String,
    /// Estimated tokens.
    pub tokens: TokenEstimate,
    /// Declared kind of work.
    pub task_type: TaskType,
    /// Requested mode.
    pub mode: EconomicMode,
    /// Owner+prompt fingerprint for the decision cache.
    pub fingerprint: Option<u64>,
}

impl InferenceRequest {
    /// Build a request from explicit token counts, without a cache key.
    pub fn from_tokens(
        owner: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        task_type: TaskType,
        mode: EconomicMode,
    ) -> Self {
        Self {
            owner: owner.into(),
            tokens: TokenEstimate {
                input_tokens,
                output_tokens,
            },
            task_type,
            mode,
            fingerprint: None,
        }
    }
}

// ── Decision ───────────────────────────────────────────────────────────

/// Why a tier was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// `cost_optimized`: first affordable tier in cost order.
    CheapestAvailable,
    /// `balanced`: best tier that survived the budget-fraction filter.
    BestQualityWithinBudget,
    /// `performance`: best affordable tier in quality order.
    PerformancePreferred,
    /// `performance`: nothing fit, cheapest available taken over budget.
    OverBudgetOverride,
    /// Repeat prompt served from the decision cache.
    CacheHit,
}

impl DecisionReason {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheapestAvailable => "cheapest_available",
            Self::BestQualityWithinBudget => "best_quality_within_budget",
            Self::PerformancePreferred => "performance_preferred",
            Self::OverBudgetOverride => "over_budget_override",
            Self::CacheHit => "cache_hit",
        }
    }
}

/// Outcome of admission control for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Unique id.
    pub id: Uuid,
    /// Owner that was charged.
    pub owner: String,
    /// Chosen tier.
    pub tier: TierId,
    /// Mode the decision was made under.
    pub mode: EconomicMode,
    /// Declared task type.
    pub task_type: TaskType,
    /// Estimated input tokens.
    pub input_tokens: u64,
    /// Estimated output tokens.
    pub output_tokens: u64,
    /// Amount debited, in micro-dollars.
    pub estimated_cost_micros: u64,
    /// What the request would have cost on the best-quality tier.
    pub baseline_cost_micros: u64,
    /// Time spent deciding.
    #[serde(with = "duration_micros")]
    pub decision_latency: Duration,
    /// Why this tier.
    pub reason: DecisionReason,
    /// `true` only for `performance` overrides.
    pub over_budget: bool,
    /// Period whose remaining budget governed the decision.
    pub binding_period: PeriodKind,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Estimated cost in USD.
    pub fn cost_usd(&self) -> f64 {
        micros_to_usd(self.estimated_cost_micros)
    }

    /// Decision latency in fractional milliseconds.
    pub fn latency_ms(&self) -> f64 {
        self.decision_latency.as_secs_f64() * 1000.0
    }
}

mod duration_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
    }
}

/// A priced tier considered for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Tier.
    pub tier: TierId,
    /// Estimated cost on this tier, in micro-dollars.
    pub cost_micros: u64,
    /// Tier quality rank.
    pub quality: u8,
}

// ── Router ─────────────────────────────────────────────────────────────

/// Stateless tier selector.
#[derive(Debug, Clone)]
pub struct TierRouter {
    registry: Arc<TierRegistry>,
}

impl TierRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<TierRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    /// Price `request` on `tier` under the current tunables.
    pub fn price(&self, tier: &Tier, request: &InferenceRequest, tunables: &RouterTunables) -> u64 {
        let cost = estimate_cost(tier, request.tokens);
        if tunables.batching_enabled && tier.batch_discount > 0.0 {
            apply_batch_discount(cost, tier.batch_discount)
        } else {
            cost
        }
    }

    /// Every configured tier, priced and ordered for the request's mode.
    ///
    /// In `balanced` mode tiers over the budget fraction are already removed.
    /// Availability and the hard budget check are not applied here.
    pub fn candidates(
        &self,
        request: &InferenceRequest,
        tunables: &RouterTunables,
        remaining_micros: u64,
    ) -> Vec<Candidate> {
        let priced = self.priced(request, tunables);
        order_candidates(priced, request, tunables, remaining_micros)
    }

    fn priced(&self, request: &InferenceRequest, tunables: &RouterTunables) -> Vec<Candidate> {
        self.registry
            .list_tiers()
            .iter()
            .map(|tier| Candidate {
                tier: tier.id,
                cost_micros: self.price(tier, request, tunables),
                quality: tier.quality_rank,
            })
            .collect()
    }

    /// Pick a tier for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BudgetExceeded`] when no available candidate fits
    /// the binding budget in `cost_optimized` or `balanced` mode.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn route(
        &self,
        request: &InferenceRequest,
        budget: &BudgetSnapshot,
        tunables: &RouterTunables,
    ) -> Result<RoutingDecision, RouterError> {
        let started = Instant::now();
        let (binding_period, remaining) = budget.binding();
        let priced = self.priced(request, tunables);
        let baseline = priced
            .iter()
            .max_by(|a, b| a.quality.cmp(&b.quality).then(a.cost_micros.cmp(&b.cost_micros)))
            .map_or(0, |c| c.cost_micros);
        let ordered = order_candidates(priced.clone(), request, tunables, remaining);

        let reason = match request.mode {
            EconomicMode::CostOptimized => DecisionReason::CheapestAvailable,
            EconomicMode::Balanced => DecisionReason::BestQualityWithinBudget,
            EconomicMode::Performance => DecisionReason::PerformancePreferred,
        };

        for candidate in &ordered {
            if !self.registry.is_available(candidate.tier) {
                debug!(tier = %candidate.tier, "skipping unavailable tier");
                continue;
            }
            if candidate.cost_micros <= remaining {
                return Ok(self.decision(
                    request,
                    candidate,
                    baseline,
                    reason,
                    false,
                    binding_period,
                    started,
                ));
            }
        }

        let cheapest = priced
            .iter()
            .filter(|c| self.registry.is_available(c.tier))
            .min_by(|a, b| a.cost_micros.cmp(&b.cost_micros).then(a.quality.cmp(&b.quality)));

        match (request.mode, cheapest) {
            (EconomicMode::Performance, Some(candidate)) => {
                warn!(
                    owner = %request.owner,
                    tier = %candidate.tier,
                    cost_usd = micros_to_usd(candidate.cost_micros),
                    remaining_usd = micros_to_usd(remaining),
                    period = %binding_period,
                    "admitting over budget in performance mode"
                );
                Ok(self.decision(
                    request,
                    candidate,
                    baseline,
                    DecisionReason::OverBudgetOverride,
                    true,
                    binding_period,
                    started,
                ))
            }
            (_, Some(candidate)) => Err(RouterError::BudgetExceeded {
                owner: request.owner.clone(),
                period: binding_period,
                required_usd: micros_to_usd(candidate.cost_micros),
                remaining_usd: micros_to_usd(remaining),
            }),
            (_, None) => Err(RouterError::TierUnavailable(
                "no configured tier is available".into(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        request: &InferenceRequest,
        candidate: &Candidate,
        baseline: u64,
        reason: DecisionReason,
        over_budget: bool,
        binding_period: PeriodKind,
        started: Instant,
    ) -> RoutingDecision {
        RoutingDecision {
            id: Uuid::new_v4(),
            owner: request.owner.clone(),
            tier: candidate.tier,
            mode: request.mode,
            task_type: request.task_type,
            input_tokens: request.tokens.input_tokens,
            output_tokens: request.tokens.output_tokens,
            estimated_cost_micros: candidate.cost_micros,
            baseline_cost_micros: baseline,
            decision_latency: started.elapsed(),
            reason,
            over_budget,
            binding_period,
            decided_at: Utc::now(),
        }
    }
}

/// Order priced candidates for the request's mode.
fn order_candidates(
    mut candidates: Vec<Candidate>,
    request: &InferenceRequest,
    tunables: &RouterTunables,
    remaining_micros: u64,
) -> Vec<Candidate> {
    let cheapest_first = |a: &Candidate, b: &Candidate| {
        a.cost_micros
            .cmp(&b.cost_micros)
            .then(a.quality.cmp(&b.quality))
            .then(a.tier.cmp(&b.tier))
    };
    let best_first = |a: &Candidate, b: &Candidate| {
        b.quality
            .cmp(&a.quality)
            .then(b.cost_micros.cmp(&a.cost_micros))
            .then(b.tier.cmp(&a.tier))
    };

    match request.mode {
        EconomicMode::CostOptimized => candidates.sort_by(cheapest_first),
        EconomicMode::Performance => candidates.sort_by(best_first),
        EconomicMode::Balanced => {
            let limit = if remaining_micros == u64::MAX {
                u64::MAX
            } else {
                (remaining_micros as f64 * tunables.balanced_budget_fraction).floor() as u64
            };
            candidates.retain(|c| c.cost_micros <= limit);
            if tunables.prefer_cheaper_tiers || request.task_type == TaskType::Simple {
                candidates.sort_by(cheapest_first);
            } else {
                // Best quality first, cheaper among equals.
                candidates.sort_by(|a, b| {
                    b.quality
                        .cmp(&a.quality)
                        .then(a.cost_micros.cmp(&b.cost_micros))
                });
            }
        }
    }
    candidates
}
