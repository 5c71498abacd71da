//! # Stage: Economic Router
//!
//! ## Responsibility
//! Own every piece of the routing path for one process and expose the
//! operations the outside world calls: route a prompt, change the default
//! mode, read statistics and health, report a failed tier, apply a
//! reloaded config.
//!
//! ## Guarantees
//! - Explicitly constructed: callers hold an `Arc<EconomicRouter>`; there is
//!   no process-wide instance
//! - Typed refusals: every rejected request returns a [`RouterError`] and is
//!   counted; nothing is silently downgraded
//! - Debit only with a decision: the ledger is charged inside the same
//!   synchronous step that produces the returned decision
//!
//! ## NOT Responsible For
//! - Running background tasks (probe, optimizer, persister are spawned by
//!   the binary)
//! - HTTP (see `web_api`)

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{validation, RouterConfig};
use crate::optimizer::{SpendSource, SpendWindow, TierSpend};
use crate::routing::{
    fingerprint, micros_to_usd, BudgetAlert, BudgetLedger, BudgetPeriod, CacheStats,
    CharRatioEstimator, DecisionCache, DecisionReason, EconomicMode, InferenceRequest,
    LatencyClass, RouterTunables, RoutingDecision, TaskType, Tier, TierId, TierRegistry,
    TierRouter, TokenEstimator, TunablesHandle, UsageSnapshot, UsageTracker,
};
use crate::RouterError;

/// Owner charged when a request names none.
pub const DEFAULT_OWNER: &str = "default";

/// Inbound routing request, as received from callers.
///
/// Every field except `prompt` is optional; strings are validated, never
/// coerced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Prompt text; only its length is used.
    pub prompt: String,
    /// `simple`, `general` or `complex`. Default `general`.
    #[serde(default)]
    pub task_type: Option<String>,
    /// `cost_optimized`, `balanced` or `performance`. Default: the live
    /// default mode.
    #[serde(default)]
    pub economic_mode: Option<String>,
    /// Project charged. Default [`DEFAULT_OWNER`].
    #[serde(default)]
    pub owner: Option<String>,
    /// Expected output tokens, overriding the estimate.
    #[serde(default)]
    pub output_tokens: Option<i64>,
}

impl RouteRequest {
    /// A request with only a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Set the economic mode string.
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.economic_mode = Some(mode.into());
        self
    }

    /// Set the owner.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the task type string.
    pub fn task(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }
}

/// One tier in a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierHealth {
    /// Tier.
    pub tier: TierId,
    /// Currently routable.
    pub available: bool,
    /// Latency class.
    pub latency_class: LatencyClass,
}

/// Liveness summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `healthy` when every tier is available, `degraded` otherwise.
    pub status: &'static str,
    /// Router name.
    pub router: String,
    /// Per-tier availability.
    pub tiers: Vec<TierHealth>,
}

/// Read-only statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Router name.
    pub router: String,
    /// Live default mode.
    pub mode: EconomicMode,
    /// Live tunables.
    pub tunables: RouterTunables,
    /// Usage counters.
    pub usage: UsageSnapshot,
    /// Decision cache counters.
    pub cache: CacheStats,
    /// Open budget periods for every owner seen.
    pub budgets: Vec<BudgetPeriod>,
    /// Most recent budget alerts, oldest first.
    pub recent_alerts: Vec<BudgetAlert>,
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    decided_at: DateTime<Utc>,
    tier: TierId,
    cost_micros: u64,
}

/// The router process's single owner of routing state.
///
/// # Panics
///
/// No method on this type panics.
pub struct EconomicRouter {
    name: String,
    max_prompt_chars: usize,
    history_capacity: usize,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn TokenEstimator>,
    router: TierRouter,
    ledger: Arc<BudgetLedger>,
    tunables: TunablesHandle,
    // Tunables section of the last config file applied.
    file_tunables: Mutex<RouterTunables>,
    cache: DecisionCache,
    usage: UsageTracker,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl std::fmt::Debug for EconomicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EconomicRouter")
            .field("name", &self.name)
            .field("tunables", &self.tunables)
            .finish()
    }
}

impl EconomicRouter {
    /// Build a router from a configuration.
    ///
    /// # Errors
    ///
    /// [`RouterError::Configuration`] if the config fails validation or the
    /// tier table is malformed.
    pub fn from_config(config: &RouterConfig, clock: Arc<dyn Clock>) -> Result<Self, RouterError> {
        validation::validate(config).map_err(|errors| {
            RouterError::Configuration(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let registry = Arc::new(TierRegistry::new(config.tiers.clone())?);
        let estimator = CharRatioEstimator::new(
            config.estimator.chars_per_token,
            config.estimator.output_ratio,
        )?;
        let ledger = Arc::new(BudgetLedger::new(config.budget.clone(), Arc::clone(&clock)));

        info!(
            router = %config.router.name,
            tiers = ?registry.list_tiers().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            mode = %config.tunables.default_mode,
            daily_ceiling_usd = config.budget.daily_ceiling_usd,
            monthly_ceiling_usd = config.budget.monthly_ceiling_usd,
            "economic router configured"
        );

        Ok(Self {
            name: config.router.name.clone(),
            max_prompt_chars: config.router.max_prompt_chars,
            history_capacity: config.router.history_capacity,
            clock,
            estimator: Arc::new(estimator),
            router: TierRouter::new(registry),
            ledger,
            tunables: TunablesHandle::new(config.tunables.clone()),
            file_tunables: Mutex::new(config.tunables.clone()),
            cache: DecisionCache::new(
                config.cache.max_entries,
                std::time::Duration::from_secs(config.cache.ttl_secs),
            ),
            usage: UsageTracker::new(),
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Replace the token estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    // ── Request path ────────────────────────────────────────────────────

    /// Validate and estimate an inbound request.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidMode`] for an unknown `economic_mode`.
    /// - [`RouterError::Estimation`] for an unknown `task_type`, an empty
    ///   owner, a negative `output_tokens` or an oversized prompt.
    pub fn prepare(&self, request: &RouteRequest) -> Result<InferenceRequest, RouterError> {
        let mode = match request.economic_mode.as_deref() {
            Some(raw) => raw.parse::<EconomicMode>()?,
            None => self.tunables.current().default_mode,
        };
        let task_type = match request.task_type.as_deref() {
            Some(raw) => raw.parse::<TaskType>()?,
            None => TaskType::default(),
        };
        let owner = match request.owner.as_deref() {
            Some(o) if o.trim().is_empty() => {
                return Err(RouterError::Estimation("owner must not be empty".into()))
            }
            Some(o) => o.to_string(),
            None => DEFAULT_OWNER.to_string(),
        };
        let chars = request.prompt.chars().count();
        if chars > self.max_prompt_chars {
            return Err(RouterError::Estimation(format!(
                "prompt has {chars} characters, limit is {}",
                self.max_prompt_chars
            )));
        }

        let mut tokens = self.estimator.estimate(&request.prompt);
        if let Some(out) = request.output_tokens {
            tokens.output_tokens = u64::try_from(out).map_err(|_| {
                RouterError::Estimation(format!("output_tokens must be non-negative, got {out}"))
            })?;
        }

        Ok(InferenceRequest {
            fingerprint: Some(fingerprint(&owner, mode, &request.prompt)),
            owner,
            tokens,
            task_type,
            mode,
        })
    }

    /// Validate, estimate and admit `request`.
    ///
    /// # Errors
    ///
    /// Everything [`prepare`](Self::prepare) and [`admit`](Self::admit)
    /// return.
    pub fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, RouterError> {
        match self.prepare(request) {
            Ok(prepared) => self.admit(&prepared),
            Err(e) => {
                self.reject(None, &e);
                Err(e)
            }
        }
    }

    /// Decide a tier for `request` and debit its estimate.
    ///
    /// # Errors
    ///
    /// - [`RouterError::BudgetExceeded`] when nothing fits in a hard-ceiling
    ///   mode.
    /// - [`RouterError::TierUnavailable`] when no tier is available.
    pub fn admit(&self, request: &InferenceRequest) -> Result<RoutingDecision, RouterError> {
        let tunables = self.tunables.current();
        let cached = if tunables.caching_enabled {
            request.fingerprint.and_then(|key| self.cache.lookup(key))
        } else {
            None
        };

        // Replay a cached result only when routing picks the same tier again.
        let result = self.ledger.admit(&request.owner, |budget| {
            let mut decision = self.router.route(request, budget, &tunables)?;
            if cached == Some(decision.tier) {
                decision.baseline_cost_micros = decision.estimated_cost_micros;
                decision.estimated_cost_micros = 0;
                decision.over_budget = false;
                decision.reason = DecisionReason::CacheHit;
            }
            let cost = decision.estimated_cost_micros;
            Ok((decision, cost))
        });

        if tunables.caching_enabled && request.fingerprint.is_some() {
            let hit = matches!(&result, Ok(d) if d.reason == DecisionReason::CacheHit);
            self.cache.record_lookup(hit);
            if let Some(stale) = cached.filter(|_| !hit) {
                debug!(tier = %stale, mode = %request.mode, "cached tier no longer chosen, routed normally");
            }
        }

        match result {
            Ok(mut decision) => {
                decision.decided_at = self.clock.now();
                if tunables.caching_enabled && decision.reason != DecisionReason::CacheHit {
                    if let Some(key) = request.fingerprint {
                        self.cache.insert(key, decision.tier);
                    }
                }
                self.record(&decision);
                Ok(decision)
            }
            Err(e) => {
                self.reject(Some(&request.owner), &e);
                Err(e)
            }
        }
    }

    fn record(&self, decision: &RoutingDecision) {
        self.usage.record_decision(decision);
        crate::metrics::record_decision(
            decision.tier.as_str(),
            decision.mode.as_str(),
            decision.reason.as_str(),
            decision.estimated_cost_micros,
            decision.decision_latency,
        );
        {
            let mut history = self.history.lock();
            history.push_back(HistoryEntry {
                decided_at: decision.decided_at,
                tier: decision.tier,
                cost_micros: decision.estimated_cost_micros,
            });
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }
        info!(
            decision_id = %decision.id,
            owner = %decision.owner,
            tier = %decision.tier,
            mode = %decision.mode,
            task_type = %decision.task_type,
            cost_usd = decision.cost_usd(),
            reason = decision.reason.as_str(),
            over_budget = decision.over_budget,
            "request routed"
        );
    }

    fn reject(&self, owner: Option<&str>, error: &RouterError) {
        self.usage.record_rejection(error);
        crate::metrics::record_rejection(error.code());
        match error {
            RouterError::BudgetExceeded { .. } => {
                warn!(owner = owner.unwrap_or("-"), error = %error, "request refused")
            }
            _ => debug!(owner = owner.unwrap_or("-"), error = %error, "request rejected"),
        }
    }

    // ── Administration ──────────────────────────────────────────────────

    /// Change the default economic mode.
    ///
    /// # Errors
    ///
    /// [`RouterError::InvalidMode`] for anything but the three wire names.
    pub fn set_mode(&self, mode: &str) -> Result<EconomicMode, RouterError> {
        let parsed: EconomicMode = mode.parse()?;
        if self.tunables.set_default_mode(parsed) {
            info!(mode = %parsed, "default economic mode changed");
        }
        Ok(parsed)
    }

    /// Live default mode.
    pub fn mode(&self) -> EconomicMode {
        self.tunables.current().default_mode
    }

    /// Mark `tier` unavailable after a transport failure. It comes back on
    /// the next successful probe. Returns `true` if availability changed;
    /// `local` is never marked down.
    pub fn report_tier_failure(&self, tier: TierId) -> bool {
        let changed = self.registry().set_available(tier, false);
        if changed {
            warn!(tier = %tier, "tier marked unavailable after transport failure");
        }
        changed
    }

    /// Apply a reloaded configuration.
    ///
    /// Tunables and budget ceilings take effect immediately. Tier, estimator
    /// and cache changes need a restart and are only logged.
    ///
    /// The live tunables are replaced only when the file's tunables section
    /// differs from the one applied last. Runtime mode changes and optimizer
    /// toggles survive reloads that leave that section alone.
    pub fn apply_config(&self, config: &RouterConfig) {
        let mut tiers: Vec<Tier> = config.tiers.iter().filter(|t| t.enabled).cloned().collect();
        tiers.sort_by_key(|t| t.id);
        if tiers.as_slice() != self.registry().list_tiers() {
            warn!("tier definitions changed; restart to apply");
        }

        {
            let mut loaded = self.file_tunables.lock();
            if *loaded == config.tunables {
                debug!("tunables section unchanged, keeping live values");
            } else {
                match self.tunables.replace(config.tunables.clone()) {
                    Ok(changed) => {
                        *loaded = config.tunables.clone();
                        if changed {
                            info!("tunables reloaded");
                        }
                    }
                    Err(errors) => warn!(?errors, "reloaded tunables rejected"),
                }
            }
        }
        if self.ledger.config() != config.budget {
            self.ledger.update_config(config.budget.clone());
            info!(
                daily_ceiling_usd = config.budget.daily_ceiling_usd,
                monthly_ceiling_usd = config.budget.monthly_ceiling_usd,
                "budget ceilings reloaded"
            );
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Usage, cache and budget statistics.
    pub fn stats(&self) -> RouterStats {
        let tunables = self.tunables.current();
        RouterStats {
            router: self.name.clone(),
            mode: tunables.default_mode,
            tunables,
            usage: self.usage.snapshot(),
            cache: self.cache.stats(),
            budgets: self.ledger.periods(),
            recent_alerts: self.ledger.recent_alerts(),
        }
    }

    /// Per-tier availability.
    pub fn health(&self) -> HealthReport {
        let tiers: Vec<TierHealth> = self
            .registry()
            .list_tiers()
            .iter()
            .map(|t| TierHealth {
                tier: t.id,
                available: self.registry().is_available(t.id),
                latency_class: t.latency_class,
            })
            .collect();
        let status = if tiers.iter().all(|t| t.available) {
            "healthy"
        } else {
            "degraded"
        };
        HealthReport {
            status,
            router: self.name.clone(),
            tiers,
        }
    }

    /// Aggregate retained decisions made at or after `since`.
    pub fn decisions_since(&self, since: DateTime<Utc>) -> SpendWindow {
        let end = self.clock.now();
        let mut window = SpendWindow::empty(since, end);
        let mut per_tier = [(0u64, 0u64); 3];
        for entry in self.history.lock().iter().filter(|e| e.decided_at >= since) {
            window.requests += 1;
            window.total_micros = window.total_micros.saturating_add(entry.cost_micros);
            let slot = &mut per_tier[entry.tier.index()];
            slot.0 += 1;
            slot.1 = slot.1.saturating_add(entry.cost_micros);
        }
        window.per_tier = TierId::ALL
            .iter()
            .zip(per_tier)
            .filter(|(_, (requests, _))| *requests > 0)
            .map(|(&tier, (requests, spend_micros))| TierSpend {
                tier,
                requests,
                spend_micros,
            })
            .collect();
        window.cheapest_tier = self.registry().cheapest();
        debug!(
            requests = window.requests,
            spend_usd = micros_to_usd(window.total_micros),
            "spend window collected"
        );
        window
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Router name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tier registry.
    pub fn registry(&self) -> &Arc<TierRegistry> {
        self.router.registry()
    }

    /// Budget ledger.
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Live tunables.
    pub fn tunables(&self) -> &TunablesHandle {
        &self.tunables
    }

    /// Clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Usage counters.
    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

#[async_trait]
impl SpendSource for EconomicRouter {
    async fn spend_since(&self, since: DateTime<Utc>) -> Result<SpendWindow, RouterError> {
        Ok(self.decisions_since(since))
    }
}
