//! Prometheus metrics for the economic router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. Every `record_*` / `set_*`
//! helper is a no-op until then, so library users and tests that never
//! initialise metrics pay nothing and never fail.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_decisions_total` | Counter | `tier`, `mode`, `reason` |
//! | `router_rejections_total` | Counter | `code` |
//! | `router_estimated_spend_usd_total` | Counter | `tier` |
//! | `router_decision_duration_seconds` | Histogram | |
//! | `router_tier_available` | Gauge | `tier` |
//! | `router_budget_alerts_total` | Counter | `level`, `period` |
//! | `router_cache_lookups_total` | Counter | `result` |
//! | `router_probe_failures_total` | Counter | `tier` |
//! | `router_optimizer_passes_total` | Counter | `outcome` |
//! | `router_recommendations_total` | Counter | `category`, `applied` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::routing::micros_to_usd;
use crate::RouterError;

/// Every router metric, registered in one private registry.
pub struct Metrics {
    /// Registry owning all descriptors.
    pub registry: Registry,
    /// Admitted decisions.
    pub decisions: IntCounterVec,
    /// Refused requests by error code.
    pub rejections: IntCounterVec,
    /// Estimated spend debited, USD.
    pub spend_usd: CounterVec,
    /// Time to reach a decision.
    pub decision_duration: Histogram,
    /// 1 when a tier is routable.
    pub tier_available: IntGaugeVec,
    /// Budget alerts raised.
    pub budget_alerts: IntCounterVec,
    /// Decision cache lookups.
    pub cache_lookups: IntCounterVec,
    /// Failed tier probes.
    pub probe_failures: IntCounterVec,
    /// Optimizer full passes.
    pub optimizer_passes: IntCounterVec,
    /// Optimizer recommendations.
    pub recommendations: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, RouterError>
where
    C: Collector + Clone + 'static,
{
    let collector = collector.map_err(|e| RouterError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| RouterError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

impl Metrics {
    /// Build a bundle whose metric names start with `prefix`.
    ///
    /// # Errors
    ///
    /// [`RouterError::Other`] if a descriptor is invalid or duplicated.
    pub fn new(prefix: &str) -> Result<Self, RouterError> {
        let registry = Registry::new();
        let name = |suffix: &str| format!("{prefix}_{suffix}");

        let decisions = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("decisions_total"), "Admitted routing decisions"),
                &["tier", "mode", "reason"],
            ),
        )?;
        let rejections = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("rejections_total"), "Refused requests by error code"),
                &["code"],
            ),
        )?;
        let spend_usd = register(
            &registry,
            CounterVec::new(
                Opts::new(name("estimated_spend_usd_total"), "Estimated spend debited in USD"),
                &["tier"],
            ),
        )?;
        let decision_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(name("decision_duration_seconds"), "Time to reach a decision")
                    .buckets(vec![1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 5e-3, 1e-2]),
            ),
        )?;
        let tier_available = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(name("tier_available"), "1 when the tier is routable"),
                &["tier"],
            ),
        )?;
        let budget_alerts = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("budget_alerts_total"), "Budget alerts raised"),
                &["level", "period"],
            ),
        )?;
        let cache_lookups = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("cache_lookups_total"), "Decision cache lookups"),
                &["result"],
            ),
        )?;
        let probe_failures = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("probe_failures_total"), "Failed tier health probes"),
                &["tier"],
            ),
        )?;
        let optimizer_passes = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("optimizer_passes_total"), "Optimizer full passes"),
                &["outcome"],
            ),
        )?;
        let recommendations = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("recommendations_total"), "Optimizer recommendations"),
                &["category", "applied"],
            ),
        )?;

        Ok(Self {
            registry,
            decisions,
            rejections,
            spend_usd,
            decision_duration,
            tier_available,
            budget_alerts,
            cache_lookups,
            probe_failures,
            optimizer_passes,
            recommendations,
        })
    }

    /// Encode this bundle in the Prometheus text format.
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Initialise the global metrics bundle. A second call is a no-op.
///
/// # Errors
///
/// [`RouterError::Other`] if metric construction fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(Metrics::new("router")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Count an admitted decision and its estimated spend.
pub fn record_decision(tier: &str, mode: &str, reason: &str, cost_micros: u64, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.decisions.get_metric_with_label_values(&[tier, mode, reason]) {
            c.inc();
        }
        if cost_micros > 0 {
            if let Ok(c) = m.spend_usd.get_metric_with_label_values(&[tier]) {
                c.inc_by(micros_to_usd(cost_micros));
            }
        }
        m.decision_duration.observe(latency.as_secs_f64());
    }
}

/// Count a refused request by its [`RouterError::code`].
pub fn record_rejection(code: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.rejections.get_metric_with_label_values(&[code]) {
            c.inc();
        }
    }
}

/// Publish a tier's availability.
pub fn set_tier_available(tier: &str, available: bool) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.tier_available.get_metric_with_label_values(&[tier]) {
            g.set(i64::from(available));
        }
    }
}

/// Count a budget alert.
pub fn record_budget_alert(level: &str, period: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.budget_alerts.get_metric_with_label_values(&[level, period]) {
            c.inc();
        }
    }
}

/// Count a decision cache lookup.
pub fn record_cache_lookup(hit: bool) {
    if let Some(m) = metrics() {
        let result = if hit { "hit" } else { "miss" };
        if let Ok(c) = m.cache_lookups.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

/// Count a failed probe.
pub fn record_probe_failure(tier: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.probe_failures.get_metric_with_label_values(&[tier]) {
            c.inc();
        }
    }
}

/// Count an optimizer pass (`completed` or `skipped`).
pub fn record_optimizer_pass(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.optimizer_passes.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a recorded recommendation.
pub fn record_recommendation(category: &str, applied: bool) {
    if let Some(m) = metrics() {
        let applied = if applied { "true" } else { "false" };
        if let Ok(c) = m
            .recommendations
            .get_metric_with_label_values(&[category, applied])
        {
            c.inc();
        }
    }
}

/// Global metrics in the Prometheus text exposition format.
///
/// Empty if metrics were never initialised.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    metrics().map_or_else(String::new, Metrics::encode)
}
