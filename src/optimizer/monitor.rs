//! Background optimization monitor.
//!
//! Two cadences share one [`OptimizationMonitor`]:
//!
//! ```text
//!  every full_pass_interval_secs:
//!      SpendSource ─▶ analyze() ─▶ Recommendation history
//!                                     │ auto_applicable
//!                                     ▼
//!                        TunablesHandle::modify (send_if_modified)
//!
//!  every budget_check_interval_secs:
//!      BudgetLedger::sweep() ─▶ rollovers + projected-overrun alerts
//! ```
//!
//! Neither cadence touches an in-flight routing decision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::analysis::{
    analyze, Analysis, OptimizationAction, OptimizerConfig, Proposal, RecommendationCategory,
    SpendWindow, TrendWindow,
};
use super::SpendSource;
use crate::clock::Clock;
use crate::routing::{micros_to_usd, BudgetLedger, SweepReport, TunablesHandle};
use crate::RouterError;

/// A recorded proposal. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    /// Unique id.
    pub id: Uuid,
    /// Category.
    pub category: RecommendationCategory,
    /// Tunable toggle, if any.
    pub action: Option<OptimizationAction>,
    /// Human-readable summary.
    pub description: String,
    /// Estimated savings in USD.
    pub estimated_savings_usd: f64,
    /// Could be applied without review.
    pub auto_applicable: bool,
    /// This recommendation changed the tunables.
    pub applied: bool,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// Outcome of one full pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    /// Spend that was analysed.
    pub window: SpendWindow,
    /// Findings and proposals.
    pub analysis: Analysis,
    /// What was recorded, in proposal order.
    pub recommendations: Vec<Recommendation>,
}

impl PassReport {
    /// Recommendations that changed the tunables.
    pub fn applied(&self) -> usize {
        self.recommendations.iter().filter(|r| r.applied).count()
    }
}

/// Monitor counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonitorStats {
    /// Completed full passes.
    pub passes: u64,
    /// Full passes skipped on error.
    pub skipped_passes: u64,
    /// Budget sweeps run.
    pub budget_checks: u64,
    /// Recommendations currently retained.
    pub recommendations: usize,
    /// Savings credited to applied recommendations, in USD.
    pub applied_savings_usd: f64,
}

#[derive(Debug)]
struct MonitorState {
    last_pass: DateTime<Utc>,
    trend: TrendWindow,
    history: VecDeque<Recommendation>,
}

/// Runs optimization passes and budget sweeps.
///
/// # Panics
///
/// No method on this type panics.
pub struct OptimizationMonitor {
    source: Arc<dyn SpendSource>,
    ledger: Arc<BudgetLedger>,
    tunables: TunablesHandle,
    clock: Arc<dyn Clock>,
    config: RwLock<OptimizerConfig>,
    state: Mutex<MonitorState>,
    applied_savings_micros: AtomicU64,
    passes: AtomicU64,
    skipped: AtomicU64,
    budget_checks: AtomicU64,
}

impl std::fmt::Debug for OptimizationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizationMonitor")
            .field("config", &*self.config.read())
            .field("stats", &self.stats())
            .finish()
    }
}

impl OptimizationMonitor {
    /// Create a monitor. The first pass covers spend from now on.
    pub fn new(
        source: Arc<dyn SpendSource>,
        ledger: Arc<BudgetLedger>,
        tunables: TunablesHandle,
        clock: Arc<dyn Clock>,
        config: OptimizerConfig,
    ) -> Self {
        let state = MonitorState {
            last_pass: clock.now(),
            trend: TrendWindow::new(config.trend_window_days),
            history: VecDeque::new(),
        };
        Self {
            source,
            ledger,
            tunables,
            clock,
            config: RwLock::new(config),
            state: Mutex::new(state),
            applied_savings_micros: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            budget_checks: AtomicU64::new(0),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> OptimizerConfig {
        self.config.read().clone()
    }

    /// Swap thresholds and savings model. Cadences keep their original
    /// intervals until restart.
    pub fn update_config(&self, config: OptimizerConfig) {
        self.state.lock().trend.set_capacity(config.trend_window_days);
        *self.config.write() = config;
    }

    /// Run one full pass over spend since the previous successful pass.
    ///
    /// # Errors
    ///
    /// [`RouterError::OptimizationCycle`] if spend could not be read. The
    /// window is not consumed, so the next pass covers it.
    pub async fn run_full_pass(&self) -> Result<PassReport, RouterError> {
        let since = self.state.lock().last_pass;
        let window = match self.source.spend_since(since).await {
            Ok(w) => w,
            Err(e) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_optimizer_pass("skipped");
                return Err(RouterError::OptimizationCycle(format!(
                    "spend retrieval failed: {e}"
                )));
            }
        };

        let config = self.config();
        let trailing = self.state.lock().trend.trailing_average();
        let analysis = analyze(&window, trailing, &config);
        if let Some(spike) = &analysis.spike {
            warn!(
                increase_pct = spike.increase * 100.0,
                current_usd = spike.current_avg_micros / 1e6,
                trailing_usd = spike.trailing_avg_micros / 1e6,
                "cost per request spiked"
            );
        }
        let recommendations = self.auto_apply(&analysis.proposals);

        {
            let mut state = self.state.lock();
            state.trend.record(&window);
            state.last_pass = window.end;
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_optimizer_pass("completed");

        let report = PassReport {
            window,
            analysis,
            recommendations,
        };
        info!(
            requests = report.window.requests,
            spend_usd = micros_to_usd(report.window.total_micros),
            recommendations = report.recommendations.len(),
            applied = report.applied(),
            "optimization pass complete"
        );
        Ok(report)
    }

    /// Record `proposals`, applying the auto-applicable ones.
    ///
    /// A recommendation is marked applied, and its savings credited, only
    /// when its toggle actually changed the tunables.
    pub fn auto_apply(&self, proposals: &[Proposal]) -> Vec<Recommendation> {
        let config = self.config();
        let now = self.clock.now();
        let recorded: Vec<Recommendation> = proposals
            .iter()
            .map(|p| {
                let applied = match p.action {
                    Some(action) if p.auto_applicable => {
                        self.apply(action, config.lowered_balanced_fraction)
                    }
                    _ => false,
                };
                if applied {
                    self.applied_savings_micros
                        .fetch_add(p.estimated_savings_micros, Ordering::Relaxed);
                }
                crate::metrics::record_recommendation(category_str(p.category), applied);
                Recommendation {
                    id: Uuid::new_v4(),
                    category: p.category,
                    action: p.action,
                    description: p.description.clone(),
                    estimated_savings_usd: micros_to_usd(p.estimated_savings_micros),
                    auto_applicable: p.auto_applicable,
                    applied,
                    created_at: now,
                }
            })
            .collect();

        let mut state = self.state.lock();
        for rec in &recorded {
            state.history.push_back(rec.clone());
        }
        while state.history.len() > config.history_capacity.max(1) {
            state.history.pop_front();
        }
        recorded
    }

    /// Apply one toggle. Returns `true` if the tunables changed.
    pub fn apply(&self, action: OptimizationAction, floor: f64) -> bool {
        let changed = self.tunables.modify(|t| action.apply(t, floor));
        if changed {
            info!(action = action.as_str(), "optimizer applied tunable change");
        } else {
            debug!(action = action.as_str(), "tunable already set");
        }
        changed
    }

    /// Sweep the ledger for expired periods and projected overruns.
    pub fn check_budgets(&self) -> SweepReport {
        let report = self.ledger.sweep();
        self.budget_checks.fetch_add(1, Ordering::Relaxed);
        debug!(
            owners = report.owners_checked,
            rolled_over = report.rolled_over,
            projection_alerts = report.projection_alerts,
            "budget check complete"
        );
        report
    }

    /// Most recent recommendations, newest first.
    pub fn recommendations(&self, limit: usize) -> Vec<Recommendation> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Savings credited so far, in USD.
    pub fn applied_savings_usd(&self) -> f64 {
        micros_to_usd(self.applied_savings_micros.load(Ordering::Relaxed))
    }

    /// Counters.
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            passes: self.passes.load(Ordering::Relaxed),
            skipped_passes: self.skipped.load(Ordering::Relaxed),
            budget_checks: self.budget_checks.load(Ordering::Relaxed),
            recommendations: self.state.lock().history.len(),
            applied_savings_usd: self.applied_savings_usd(),
        }
    }

    /// Spawn both cadences. Each stops when `shutdown` flips to `true` or
    /// its sender is dropped.
    ///
    /// The first full pass runs one interval after start; the first budget
    /// sweep runs immediately.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = self.config();
        let full_every = Duration::from_secs(config.full_pass_interval_secs.max(1));
        let check_every = Duration::from_secs(config.budget_check_interval_secs.max(1));
        info!(
            full_pass_secs = full_every.as_secs(),
            budget_check_secs = check_every.as_secs(),
            "optimization monitor started"
        );

        let full = {
            let monitor = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + full_every, full_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = monitor.run_full_pass().await {
                                warn!(error = %e, "optimization pass skipped");
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("full-pass cadence stopped");
            })
        };

        let checks = {
            let monitor = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(check_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.check_budgets();
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("budget-check cadence stopped");
            })
        };

        vec![full, checks]
    }
}

fn category_str(category: RecommendationCategory) -> &'static str {
    match category {
        RecommendationCategory::CostSpike => "cost_spike",
        RecommendationCategory::Inefficiency => "inefficiency",
        RecommendationCategory::Batching => "batching",
        RecommendationCategory::Caching => "caching",
        RecommendationCategory::CheaperModel => "cheaper_model",
    }
}
