//! # Spend Analysis
//!
//! ## Responsibility
//! Turn one window of routing spend plus the trailing daily trend into
//! findings (cost spike, tier inefficiency) and savings proposals
//! (batching, caching, cheaper-tier routing).
//!
//! ## Guarantees
//! - Pure: [`analyze`] reads its arguments only; no clock, no I/O, no locks
//! - Every threshold and savings percentage comes from [`OptimizerConfig`]
//! - Bounded memory: [`TrendWindow`] keeps at most `trend_window_days` days
//!
//! ## NOT Responsible For
//! - Applying proposals (see `monitor`)
//! - Collecting spend (see [`super::SpendSource`])

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::routing::{micros_to_usd, RouterTunables, TierId};

// ─── Configuration ───────────────────────────────────────────────────────────

fn default_full_pass_interval_secs() -> u64 {
    3_600
}

fn default_budget_check_interval_secs() -> u64 {
    60
}

fn default_trend_window_days() -> usize {
    7
}

fn default_anomaly_threshold() -> f64 {
    0.20
}

fn default_inefficiency_share() -> f64 {
    0.40
}

fn default_batching_min_requests() -> u64 {
    100
}

fn default_batching_savings() -> f64 {
    0.30
}

fn default_caching_savings() -> f64 {
    0.25
}

fn default_cheaper_model_savings() -> f64 {
    0.20
}

fn default_lowered_balanced_fraction() -> f64 {
    0.25
}

fn default_history_capacity() -> usize {
    200
}

fn default_true() -> bool {
    true
}

/// Which proposals the monitor may apply without review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AutoApplyConfig {
    /// Turn on result caching.
    #[serde(default = "default_true")]
    pub caching: bool,
    /// Turn on batch pricing.
    #[serde(default = "default_true")]
    pub batching: bool,
    /// Make balanced mode prefer cheaper tiers.
    #[serde(default)]
    pub cheaper_tiers: bool,
    /// Lower the balanced-mode budget fraction after a cost spike.
    #[serde(default)]
    pub balanced_fraction: bool,
}

impl Default for AutoApplyConfig {
    fn default() -> Self {
        Self {
            caching: true,
            batching: true,
            cheaper_tiers: false,
            balanced_fraction: false,
        }
    }
}

/// Optimization monitor schedule, thresholds and savings model.
///
/// # Example
///
/// ```toml
/// [optimizer]
/// full_pass_interval_secs = 900
/// anomaly_threshold = 0.3
///
/// [optimizer.auto_apply]
/// cheaper_tiers = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OptimizerConfig {
    /// Seconds between full optimization passes.
    #[serde(default = "default_full_pass_interval_secs")]
    pub full_pass_interval_secs: u64,
    /// Seconds between budget sweeps.
    #[serde(default = "default_budget_check_interval_secs")]
    pub budget_check_interval_secs: u64,
    /// Daily snapshots kept for the trailing trend.
    #[serde(default = "default_trend_window_days")]
    pub trend_window_days: usize,
    /// Cost-per-request rise over the trailing average that counts as a spike.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    /// Spend share above which a non-cheapest tier is flagged.
    #[serde(default = "default_inefficiency_share")]
    pub inefficiency_share: f64,
    /// Window request count at which batching is proposed.
    #[serde(default = "default_batching_min_requests")]
    pub batching_min_requests: u64,
    /// Expected batching savings as a fraction of window spend.
    #[serde(default = "default_batching_savings")]
    pub batching_savings: f64,
    /// Expected caching savings as a fraction of window spend.
    #[serde(default = "default_caching_savings")]
    pub caching_savings: f64,
    /// Expected cheaper-tier savings as a fraction of premium spend.
    #[serde(default = "default_cheaper_model_savings")]
    pub cheaper_model_savings: f64,
    /// Balanced fraction installed by `lower_balanced_fraction`.
    #[serde(default = "default_lowered_balanced_fraction")]
    pub lowered_balanced_fraction: f64,
    /// Recommendations retained for the API.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Auto-apply permissions.
    #[serde(default)]
    pub auto_apply: AutoApplyConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            full_pass_interval_secs: default_full_pass_interval_secs(),
            budget_check_interval_secs: default_budget_check_interval_secs(),
            trend_window_days: default_trend_window_days(),
            anomaly_threshold: default_anomaly_threshold(),
            inefficiency_share: default_inefficiency_share(),
            batching_min_requests: default_batching_min_requests(),
            batching_savings: default_batching_savings(),
            caching_savings: default_caching_savings(),
            cheaper_model_savings: default_cheaper_model_savings(),
            lowered_balanced_fraction: default_lowered_balanced_fraction(),
            history_capacity: default_history_capacity(),
            auto_apply: AutoApplyConfig::default(),
        }
    }
}

fn fraction_ok(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl OptimizerConfig {
    /// Validate. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.full_pass_interval_secs == 0 {
            errors.push("optimizer.full_pass_interval_secs must be at least 1".into());
        }
        if self.budget_check_interval_secs == 0 {
            errors.push("optimizer.budget_check_interval_secs must be at least 1".into());
        }
        if self.trend_window_days == 0 {
            errors.push("optimizer.trend_window_days must be at least 1".into());
        }
        if self.history_capacity == 0 {
            errors.push("optimizer.history_capacity must be at least 1".into());
        }
        if !self.anomaly_threshold.is_finite() || self.anomaly_threshold < 0.0 {
            errors.push(format!(
                "optimizer.anomaly_threshold must be a finite non-negative number, got {}",
                self.anomaly_threshold
            ));
        }
        for (name, value) in [
            ("inefficiency_share", self.inefficiency_share),
            ("batching_savings", self.batching_savings),
            ("caching_savings", self.caching_savings),
            ("cheaper_model_savings", self.cheaper_model_savings),
        ] {
            if !fraction_ok(value) {
                errors.push(format!("optimizer.{name} must be in [0, 1], got {value}"));
            }
        }
        let f = self.lowered_balanced_fraction;
        if !(f > 0.0 && f <= 1.0) {
            errors.push(format!(
                "optimizer.lowered_balanced_fraction must be in (0, 1], got {f}"
            ));
        }
        errors
    }
}

// ─── Spend window ────────────────────────────────────────────────────────────

/// Spend routed to one tier inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierSpend {
    /// Tier.
    pub tier: TierId,
    /// Decisions routed there.
    pub requests: u64,
    /// Estimated spend in micro-dollars.
    pub spend_micros: u64,
}

/// Aggregated routing spend between two instants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Admitted decisions.
    pub requests: u64,
    /// Estimated spend in micro-dollars.
    pub total_micros: u64,
    /// Per-tier breakdown; tiers with no traffic may be omitted.
    pub per_tier: Vec<TierSpend>,
    /// Cheapest configured tier, never flagged as inefficient.
    pub cheapest_tier: Option<TierId>,
}

impl SpendWindow {
    /// A window with no traffic.
    pub fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            requests: 0,
            total_micros: 0,
            per_tier: Vec::new(),
            cheapest_tier: None,
        }
    }

    /// Average spend per request in micro-dollars, `None` without traffic.
    pub fn avg_cost_micros(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.total_micros as f64 / self.requests as f64)
    }

    /// Spend routed to `tier`.
    pub fn tier_spend(&self, tier: TierId) -> u64 {
        self.per_tier
            .iter()
            .filter(|t| t.tier == tier)
            .map(|t| t.spend_micros)
            .sum()
    }
}

// ─── Trend ───────────────────────────────────────────────────────────────────

/// Totals for one UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySnapshot {
    /// UTC calendar day.
    pub day: NaiveDate,
    /// Decisions that day.
    pub requests: u64,
    /// Spend that day in micro-dollars.
    pub total_micros: u64,
}

/// Rolling per-day history.
#[derive(Debug, Clone)]
pub struct TrendWindow {
    capacity: usize,
    days: VecDeque<DaySnapshot>,
}

impl TrendWindow {
    /// Keep at most `capacity` days.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            days: VecDeque::new(),
        }
    }

    /// Fold `window` into the day its end falls on.
    pub fn record(&mut self, window: &SpendWindow) {
        let day = window.end.date_naive();
        match self.days.back_mut() {
            Some(last) if last.day == day => {
                last.requests = last.requests.saturating_add(window.requests);
                last.total_micros = last.total_micros.saturating_add(window.total_micros);
            }
            _ => {
                self.days.push_back(DaySnapshot {
                    day,
                    requests: window.requests,
                    total_micros: window.total_micros,
                });
            }
        }
        while self.days.len() > self.capacity {
            self.days.pop_front();
        }
    }

    /// Request-weighted average cost per request across kept days.
    pub fn trailing_average(&self) -> Option<f64> {
        let (requests, total) = self.days.iter().fold((0u64, 0u64), |(r, t), d| {
            (r.saturating_add(d.requests), t.saturating_add(d.total_micros))
        });
        (requests > 0).then(|| total as f64 / requests as f64)
    }

    /// Kept days, oldest first.
    pub fn days(&self) -> impl Iterator<Item = &DaySnapshot> {
        self.days.iter()
    }

    /// Change the retention; drops the oldest days if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.days.len() > self.capacity {
            self.days.pop_front();
        }
    }
}

// ─── Findings and proposals ──────────────────────────────────────────────────

/// Tunable toggles the monitor can flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationAction {
    /// Set `caching_enabled`.
    EnableCaching,
    /// Set `batching_enabled`.
    EnableBatching,
    /// Set `prefer_cheaper_tiers`.
    PreferCheaperTiers,
    /// Lower `balanced_budget_fraction` to the configured floor.
    LowerBalancedFraction,
}

impl OptimizationAction {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnableCaching => "enable_caching",
            Self::EnableBatching => "enable_batching",
            Self::PreferCheaperTiers => "prefer_cheaper_tiers",
            Self::LowerBalancedFraction => "lower_balanced_fraction",
        }
    }

    /// Apply to `tunables`. Returns `true` only if something changed.
    ///
    /// Lowering the fraction never raises it: a fraction already at or
    /// below `floor` is left alone.
    pub fn apply(self, tunables: &mut RouterTunables, floor: f64) -> bool {
        fn set(flag: &mut bool) -> bool {
            !std::mem::replace(flag, true)
        }
        match self {
            Self::EnableCaching => set(&mut tunables.caching_enabled),
            Self::EnableBatching => set(&mut tunables.batching_enabled),
            Self::PreferCheaperTiers => set(&mut tunables.prefer_cheaper_tiers),
            Self::LowerBalancedFraction => {
                if tunables.balanced_budget_fraction > floor {
                    tunables.balanced_budget_fraction = floor;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// What a proposal is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    /// Average cost per request jumped above the trailing trend.
    CostSpike,
    /// One tier takes an outsized share of spend.
    Inefficiency,
    /// Group requests for discounted pricing.
    Batching,
    /// Serve repeated prompts from cache.
    Caching,
    /// Shift traffic off the premium tier.
    CheaperModel,
}

/// Cost-per-request spike against the trailing trend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostSpike {
    /// Window average, micro-dollars per request.
    pub current_avg_micros: f64,
    /// Trailing average, micro-dollars per request.
    pub trailing_avg_micros: f64,
    /// Relative increase, e.g. `0.35` for +35%.
    pub increase: f64,
}

/// A tier whose share of spend is above the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Inefficiency {
    /// Tier.
    pub tier: TierId,
    /// Its share of window spend.
    pub share: f64,
}

/// One suggested change, before it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    /// Category.
    pub category: RecommendationCategory,
    /// Tunable toggle, if the proposal has one.
    pub action: Option<OptimizationAction>,
    /// Human-readable summary.
    pub description: String,
    /// Estimated savings in micro-dollars over a window like this one.
    pub estimated_savings_micros: u64,
    /// May be applied without review.
    pub auto_applicable: bool,
}

/// Result of one [`analyze`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analysis {
    /// Cost spike, if any.
    pub spike: Option<CostSpike>,
    /// Inefficient tiers.
    pub inefficiencies: Vec<Inefficiency>,
    /// Proposals in category order.
    pub proposals: Vec<Proposal>,
}

fn share_of(total: u64, fraction: f64) -> u64 {
    (total as f64 * fraction).round() as u64
}

/// Analyse `window` against the trailing average cost per request.
///
/// A window without traffic has no spike and only the caching proposal,
/// with zero estimated savings.
pub fn analyze(window: &SpendWindow, trailing_avg_micros: Option<f64>, config: &OptimizerConfig) -> Analysis {
    let mut analysis = Analysis::default();
    let total = window.total_micros;

    if let (Some(current), Some(trailing)) = (
        window.avg_cost_micros(),
        trailing_avg_micros.filter(|t| *t > 0.0),
    ) {
        if current > trailing * (1.0 + config.anomaly_threshold) {
            let increase = current / trailing - 1.0;
            analysis.spike = Some(CostSpike {
                current_avg_micros: current,
                trailing_avg_micros: trailing,
                increase,
            });
            let excess = ((current - trailing) * window.requests as f64).round() as u64;
            analysis.proposals.push(Proposal {
                category: RecommendationCategory::CostSpike,
                action: Some(OptimizationAction::LowerBalancedFraction),
                description: format!(
                    "cost per request up {:.0}% over trailing average (${:.6} vs ${:.6})",
                    increase * 100.0,
                    current / 1e6,
                    trailing / 1e6,
                ),
                estimated_savings_micros: excess,
                auto_applicable: config.auto_apply.balanced_fraction,
            });
        }
    }

    if total > 0 {
        for spend in &window.per_tier {
            if Some(spend.tier) == window.cheapest_tier {
                continue;
            }
            let share = spend.spend_micros as f64 / total as f64;
            if share > config.inefficiency_share {
                analysis.inefficiencies.push(Inefficiency {
                    tier: spend.tier,
                    share,
                });
                analysis.proposals.push(Proposal {
                    category: RecommendationCategory::Inefficiency,
                    action: None,
                    description: format!(
                        "tier {} takes {:.0}% of spend (${:.2})",
                        spend.tier,
                        share * 100.0,
                        micros_to_usd(spend.spend_micros),
                    ),
                    estimated_savings_micros: 0,
                    auto_applicable: false,
                });
            }
        }
    }

    if window.requests > 0 && window.requests >= config.batching_min_requests {
        analysis.proposals.push(Proposal {
            category: RecommendationCategory::Batching,
            action: Some(OptimizationAction::EnableBatching),
            description: format!(
                "{} requests in window; batch pricing applies to discounted tiers",
                window.requests
            ),
            estimated_savings_micros: share_of(total, config.batching_savings),
            auto_applicable: config.auto_apply.batching,
        });
    }

    analysis.proposals.push(Proposal {
        category: RecommendationCategory::Caching,
        action: Some(OptimizationAction::EnableCaching),
        description: "serve repeated prompts from the decision cache".into(),
        estimated_savings_micros: share_of(total, config.caching_savings),
        auto_applicable: config.auto_apply.caching,
    });

    let premium = window.tier_spend(TierId::Premium);
    if premium > 0 {
        analysis.proposals.push(Proposal {
            category: RecommendationCategory::CheaperModel,
            action: Some(OptimizationAction::PreferCheaperTiers),
            description: format!(
                "route balanced traffic cheapest-first; premium spend ${:.2}",
                micros_to_usd(premium)
            ),
            estimated_savings_micros: share_of(premium, config.cheaper_model_savings),
            auto_applicable: config.auto_apply.cheaper_tiers,
        });
    }

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn window(requests: u64, per_tier: &[(TierId, u64, u64)]) -> SpendWindow {
        SpendWindow {
            start: at(10, 0),
            end: at(10, 1),
            requests,
            total_micros: per_tier.iter().map(|t| t.2).sum(),
            per_tier: per_tier
                .iter()
                .map(|&(tier, requests, spend_micros)| TierSpend {
                    tier,
                    requests,
                    spend_micros,
                })
                .collect(),
            cheapest_tier: Some(TierId::Local),
        }
    }

    fn categories(a: &Analysis) -> Vec<RecommendationCategory> {
        a.proposals.iter().map(|p| p.category).collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(OptimizerConfig::default().validate().is_empty());
    }

    #[test]
    fn test_config_rejects_share_above_one() {
        let cfg = OptimizerConfig {
            caching_savings: 1.5,
            ..OptimizerConfig::default()
        };
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("caching_savings"));
    }

    #[test]
    fn test_config_rejects_zero_intervals() {
        let cfg = OptimizerConfig {
            full_pass_interval_secs: 0,
            budget_check_interval_secs: 0,
            ..OptimizerConfig::default()
        };
        assert_eq!(cfg.validate().len(), 2);
    }

    #[test]
    fn test_empty_window_still_proposes_caching() {
        let w = SpendWindow::empty(at(10, 0), at(10, 1));
        let a = analyze(&w, Some(5.0), &OptimizerConfig::default());
        assert!(a.spike.is_none());
        assert!(a.inefficiencies.is_empty());
        assert_eq!(categories(&a), vec![RecommendationCategory::Caching]);
        assert_eq!(a.proposals[0].estimated_savings_micros, 0);
        assert_eq!(a.proposals[0].action, Some(OptimizationAction::EnableCaching));
    }

    #[test]
    fn test_caching_is_always_proposed() {
        let w = window(1, &[(TierId::Local, 1, 0)]);
        let a = analyze(&w, None, &OptimizerConfig::default());
        assert_eq!(categories(&a), vec![RecommendationCategory::Caching]);
        assert_eq!(a.proposals[0].estimated_savings_micros, 0);
    }

    #[test]
    fn test_spike_flagged_above_threshold() {
        // 10 requests, $0.012 each vs trailing $0.010 => +20% is not a spike,
        // $0.0121 is.
        let at_threshold = window(10, &[(TierId::Local, 10, 120_000)]);
        let cfg = OptimizerConfig::default();
        assert!(analyze(&at_threshold, Some(10_000.0), &cfg).spike.is_none());

        let above = window(10, &[(TierId::Local, 10, 121_000)]);
        let a = analyze(&above, Some(10_000.0), &cfg);
        let spike = a.spike.expect("test: spike expected");
        assert!((spike.increase - 0.21).abs() < 1e-9);
        let proposal = &a.proposals[0];
        assert_eq!(proposal.action, Some(OptimizationAction::LowerBalancedFraction));
        assert_eq!(proposal.estimated_savings_micros, 21_000);
        assert!(!proposal.auto_applicable);
    }

    #[test]
    fn test_no_trailing_history_means_no_spike() {
        let w = window(10, &[(TierId::Premium, 10, 1_000_000)]);
        assert!(analyze(&w, None, &OptimizerConfig::default()).spike.is_none());
    }

    #[test]
    fn test_inefficiency_skips_cheapest_tier() {
        let w = window(
            10,
            &[
                (TierId::Local, 6, 500_000),
                (TierId::Elastic, 3, 300_000),
                (TierId::Premium, 1, 200_000),
            ],
        );
        let a = analyze(&w, None, &OptimizerConfig::default());
        assert!(a.inefficiencies.is_empty(), "local is cheapest, 30% and 20% are under 40%");

        let w = window(10, &[(TierId::Local, 5, 100_000), (TierId::Premium, 5, 900_000)]);
        let a = analyze(&w, None, &OptimizerConfig::default());
        assert_eq!(a.inefficiencies.len(), 1);
        assert_eq!(a.inefficiencies[0].tier, TierId::Premium);
        assert!((a.inefficiencies[0].share - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_batching_needs_minimum_volume() {
        let cfg = OptimizerConfig::default();
        let small = window(99, &[(TierId::Elastic, 99, 1_000_000)]);
        assert!(!categories(&analyze(&small, None, &cfg)).contains(&RecommendationCategory::Batching));

        let big = window(100, &[(TierId::Elastic, 100, 1_000_000)]);
        let a = analyze(&big, None, &cfg);
        let batching = a
            .proposals
            .iter()
            .find(|p| p.category == RecommendationCategory::Batching)
            .expect("test: batching proposed");
        assert_eq!(batching.estimated_savings_micros, 300_000);
        assert!(batching.auto_applicable);
    }

    #[test]
    fn test_cheaper_model_uses_premium_spend_only() {
        let w = window(4, &[(TierId::Elastic, 2, 1_000_000), (TierId::Premium, 2, 2_000_000)]);
        let a = analyze(&w, None, &OptimizerConfig::default());
        let cheaper = a
            .proposals
            .iter()
            .find(|p| p.category == RecommendationCategory::CheaperModel)
            .expect("test: cheaper model proposed");
        assert_eq!(cheaper.estimated_savings_micros, 400_000);
        assert_eq!(cheaper.action, Some(OptimizationAction::PreferCheaperTiers));
    }

    #[test]
    fn test_savings_percentages_follow_config() {
        let cfg = OptimizerConfig {
            caching_savings: 0.5,
            ..OptimizerConfig::default()
        };
        let w = window(2, &[(TierId::Local, 2, 1_000)]);
        let a = analyze(&w, None, &cfg);
        assert_eq!(categories(&a), vec![RecommendationCategory::Caching]);
        assert_eq!(a.proposals[0].estimated_savings_micros, 500);
    }

    #[test]
    fn test_action_apply_is_idempotent() {
        let mut t = RouterTunables::default();
        assert!(OptimizationAction::EnableCaching.apply(&mut t, 0.25));
        assert!(!OptimizationAction::EnableCaching.apply(&mut t, 0.25));
        assert!(OptimizationAction::LowerBalancedFraction.apply(&mut t, 0.25));
        assert!(!OptimizationAction::LowerBalancedFraction.apply(&mut t, 0.25));
        assert!((t.balanced_budget_fraction - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lower_fraction_never_raises() {
        let mut t = RouterTunables {
            balanced_budget_fraction: 0.1,
            ..RouterTunables::default()
        };
        assert!(!OptimizationAction::LowerBalancedFraction.apply(&mut t, 0.25));
        assert!((t.balanced_budget_fraction - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_trend_window_merges_same_day_and_caps_days() {
        let mut trend = TrendWindow::new(2);
        let mut w = window(2, &[(TierId::Local, 2, 200)]);
        trend.record(&w);
        trend.record(&w);
        assert_eq!(trend.days().count(), 1);
        assert_eq!(trend.trailing_average(), Some(100.0));

        w.end = at(11, 1);
        trend.record(&w);
        w.end = at(12, 1);
        trend.record(&w);
        let days: Vec<NaiveDate> = trend.days().map(|d| d.day).collect();
        assert_eq!(days, vec![at(11, 0).date_naive(), at(12, 0).date_naive()]);
    }

    #[test]
    fn test_trend_window_empty_has_no_average() {
        assert_eq!(TrendWindow::new(7).trailing_average(), None);
    }
}
