//! Per-owner budget ledger.
//!
//! ## Responsibility
//! Track spend against daily and monthly ceilings for every owner, roll
//! periods over lazily at UTC calendar boundaries, and raise threshold alerts
//! exactly once per period.
//!
//! ## Guarantees
//! - Decide-and-debit is atomic per owner: [`BudgetLedger::admit`] runs the
//!   routing decision and the debit inside one owner-scoped critical section.
//!   Two concurrent requests for the same owner can never both observe the
//!   same remaining budget.
//! - No `.await` happens while an owner lock is held; events are published
//!   after the lock is released.
//! - Spend only ever grows within a period; a rollover archives the old
//!   period and opens a fresh one with zero spend.
//!
//! ## NOT Responsible For
//! - Choosing a tier (see [`super::router::TierRouter`])
//! - Persistence (see [`super::store`]); the ledger only publishes events

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::estimator::{micros_to_usd, usd_to_micros};
use crate::clock::Clock;
use crate::RouterError;

/// Minimum fraction of a period that must have elapsed before a spend
/// projection is trusted.
const PROJECTION_MIN_ELAPSED_FRACTION: f64 = 0.1;

/// Capacity of the ledger event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Recent alerts retained for the stats surface.
const ALERT_HISTORY_CAPACITY: usize = 100;

// ── Configuration ─────────────────────────────────────────────────────────

fn default_daily_ceiling_usd() -> f64 {
    100.0
}

fn default_monthly_ceiling_usd() -> f64 {
    2_000.0
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_archive_capacity() -> usize {
    64
}

/// Budget ceilings and alerting.
///
/// Ceilings are in USD. `inf` (TOML `inf`) means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BudgetConfig {
    /// Default daily ceiling for every owner.
    #[serde(default = "default_daily_ceiling_usd")]
    pub daily_ceiling_usd: f64,
    /// Default monthly ceiling for every owner.
    #[serde(default = "default_monthly_ceiling_usd")]
    pub monthly_ceiling_usd: f64,
    /// Utilization at which the warning alert fires, in `(0, 1]`.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Per-owner overrides; unset fields inherit the defaults.
    #[serde(default)]
    pub owners: BTreeMap<String, OwnerBudget>,
    /// Closed periods retained in memory.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_ceiling_usd: default_daily_ceiling_usd(),
            monthly_ceiling_usd: default_monthly_ceiling_usd(),
            alert_threshold: default_alert_threshold(),
            owners: BTreeMap::new(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

/// Ceiling overrides for a single owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OwnerBudget {
    /// Daily ceiling override in USD.
    #[serde(default)]
    pub daily_ceiling_usd: Option<f64>,
    /// Monthly ceiling override in USD.
    #[serde(default)]
    pub monthly_ceiling_usd: Option<f64>,
}

impl BudgetConfig {
    /// Effective ceiling for `owner` in `kind`, in micro-dollars.
    pub fn ceiling_micros(&self, owner: &str, kind: PeriodKind) -> u64 {
        let overrides = self.owners.get(owner);
        let usd = match kind {
            PeriodKind::Daily => overrides
                .and_then(|o| o.daily_ceiling_usd)
                .unwrap_or(self.daily_ceiling_usd),
            PeriodKind::Monthly => overrides
                .and_then(|o| o.monthly_ceiling_usd)
                .unwrap_or(self.monthly_ceiling_usd),
        };
        usd_to_micros(usd)
    }

    /// Validate. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut check = |field: String, value: f64| {
            if value.is_nan() || value < 0.0 {
                errors.push(format!("{field} must be >= 0 (or inf), got {value}"));
            }
        };
        check("budget.daily_ceiling_usd".into(), self.daily_ceiling_usd);
        check("budget.monthly_ceiling_usd".into(), self.monthly_ceiling_usd);
        for (owner, o) in &self.owners {
            if let Some(v) = o.daily_ceiling_usd {
                check(format!("budget.owners.{owner}.daily_ceiling_usd"), v);
            }
            if let Some(v) = o.monthly_ceiling_usd {
                check(format!("budget.owners.{owner}.monthly_ceiling_usd"), v);
            }
        }
        if !(self.alert_threshold > 0.0 && self.alert_threshold <= 1.0) {
            errors.push(format!(
                "budget.alert_threshold must be in (0, 1], got {}",
                self.alert_threshold
            ));
        }
        errors
    }
}

// ── Periods ───────────────────────────────────────────────────────────────

/// Budget period granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    /// UTC calendar day.
    Daily,
    /// UTC calendar month.
    Monthly,
}

impl PeriodKind {
    /// Both kinds.
    pub const ALL: [PeriodKind; 2] = [PeriodKind::Daily, PeriodKind::Monthly];

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// `[start, end)` of the period containing `now`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn bounds(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        match self {
            Self::Daily => {
                let start = midnight(today);
                (start, start + Duration::days(1))
            }
            Self::Monthly => {
                let first = today.with_day(1).unwrap_or(today);
                let (year, month) = if first.month() == 12 {
                    (first.year() + 1, 1)
                } else {
                    (first.year(), first.month() + 1)
                };
                let next = NaiveDate::from_ymd_opt(year, month, 1)
                    .unwrap_or_else(|| first + Duration::days(31));
                (midnight(first), midnight(next))
            }
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// One accounting window for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPeriod {
    /// Owning project.
    pub owner: String,
    /// Daily or monthly.
    pub kind: PeriodKind,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Ceiling in micro-dollars; `u64::MAX` is unlimited.
    pub ceiling_micros: u64,
    /// Spend so far in micro-dollars.
    pub spent_micros: u64,
    /// Number of debits recorded.
    pub debit_count: u64,
    /// Warning alert already raised in this period.
    #[serde(default)]
    pub warning_sent: bool,
    /// Exceeded alert already raised in this period.
    #[serde(default)]
    pub exceeded_sent: bool,
    /// Projected-overrun alert already raised in this period.
    #[serde(default)]
    pub projection_sent: bool,
}

impl BudgetPeriod {
    /// Open a fresh, empty period containing `now`.
    pub fn open(owner: &str, kind: PeriodKind, ceiling_micros: u64, now: DateTime<Utc>) -> Self {
        let (start, end) = kind.bounds(now);
        Self {
            owner: owner.to_string(),
            kind,
            start,
            end,
            ceiling_micros,
            spent_micros: 0,
            debit_count: 0,
            warning_sent: false,
            exceeded_sent: false,
            projection_sent: false,
        }
    }

    /// Whether `now` is at or past the end boundary.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Ceiling minus spend, clamped at zero.
    pub fn remaining_micros(&self) -> u64 {
        self.ceiling_micros.saturating_sub(self.spent_micros)
    }

    /// Whether the ceiling is unlimited.
    pub fn is_unlimited(&self) -> bool {
        self.ceiling_micros == u64::MAX
    }

    /// Spend divided by ceiling. A zero ceiling with any spend is `inf`.
    pub fn utilization(&self) -> f64 {
        if self.ceiling_micros == 0 {
            if self.spent_micros == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            self.spent_micros as f64 / self.ceiling_micros as f64
        }
    }

    fn record(&mut self, amount_micros: u64, warning_at: f64, now: DateTime<Utc>) -> Vec<BudgetAlert> {
        self.spent_micros = self.spent_micros.saturating_add(amount_micros);
        self.debit_count += 1;
        self.threshold_alerts(warning_at, now)
    }

    fn threshold_alerts(&mut self, warning_at: f64, now: DateTime<Utc>) -> Vec<BudgetAlert> {
        let mut alerts = Vec::new();
        if self.is_unlimited() {
            return alerts;
        }
        let utilization = self.utilization();
        if !self.warning_sent && utilization >= warning_at {
            self.warning_sent = true;
            alerts.push(BudgetAlert::new(self, AlertLevel::Warning, utilization, now));
        }
        if !self.exceeded_sent && utilization >= 1.0 {
            self.exceeded_sent = true;
            alerts.push(BudgetAlert::new(self, AlertLevel::Exceeded, utilization, now));
        }
        alerts
    }

    fn projection_alert(&mut self, now: DateTime<Utc>) -> Option<BudgetAlert> {
        if self.is_unlimited() || self.projection_sent || self.spent_micros == 0 {
            return None;
        }
        let total = (self.end - self.start).num_seconds() as f64;
        let elapsed = (now - self.start).num_seconds() as f64;
        if total <= 0.0 || elapsed < total * PROJECTION_MIN_ELAPSED_FRACTION {
            return None;
        }
        let projected = self.spent_micros as f64 * total / elapsed;
        if projected <= self.ceiling_micros as f64 {
            return None;
        }
        self.projection_sent = true;
        let ratio = if self.ceiling_micros == 0 {
            f64::INFINITY
        } else {
            projected / self.ceiling_micros as f64
        };
        Some(BudgetAlert::new(self, AlertLevel::ProjectedOverrun, ratio, now))
    }
}

// ── Views ─────────────────────────────────────────────────────────────────

/// Ceiling and spend of one period at the moment of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodView {
    /// Which period.
    pub kind: PeriodKind,
    /// Ceiling in micro-dollars.
    pub ceiling_micros: u64,
    /// Spend in micro-dollars.
    pub spent_micros: u64,
}

impl PeriodView {
    /// Ceiling minus spend, clamped at zero.
    pub fn remaining_micros(&self) -> u64 {
        self.ceiling_micros.saturating_sub(self.spent_micros)
    }
}

impl From<&BudgetPeriod> for PeriodView {
    fn from(p: &BudgetPeriod) -> Self {
        Self {
            kind: p.kind,
            ceiling_micros: p.ceiling_micros,
            spent_micros: p.spent_micros,
        }
    }
}

/// Both periods for one owner, as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    /// Current daily period.
    pub daily: PeriodView,
    /// Current monthly period.
    pub monthly: PeriodView,
}

impl BudgetSnapshot {
    /// Build a snapshot from raw micro-dollar values.
    pub fn new(daily_ceiling: u64, daily_spent: u64, monthly_ceiling: u64, monthly_spent: u64) -> Self {
        Self {
            daily: PeriodView {
                kind: PeriodKind::Daily,
                ceiling_micros: daily_ceiling,
                spent_micros: daily_spent,
            },
            monthly: PeriodView {
                kind: PeriodKind::Monthly,
                ceiling_micros: monthly_ceiling,
                spent_micros: monthly_spent,
            },
        }
    }

    /// No ceilings at all.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX, 0, u64::MAX, 0)
    }

    /// The period with the least remaining budget, and that remaining amount.
    ///
    /// Ties resolve to daily.
    pub fn binding(&self) -> (PeriodKind, u64) {
        let daily = self.daily.remaining_micros();
        let monthly = self.monthly.remaining_micros();
        if monthly < daily {
            (PeriodKind::Monthly, monthly)
        } else {
            (PeriodKind::Daily, daily)
        }
    }
}

// ── Alerts and events ─────────────────────────────────────────────────────

/// Budget alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Utilization reached the warning threshold.
    Warning,
    /// Utilization reached 100%.
    Exceeded,
    /// Current burn rate would overrun the ceiling before the period ends.
    ProjectedOverrun,
}

impl AlertLevel {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Exceeded => "exceeded",
            Self::ProjectedOverrun => "projected_overrun",
        }
    }
}

/// A raised budget alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    /// Owner the alert is about.
    pub owner: String,
    /// Period the alert is about.
    pub period: PeriodKind,
    /// Severity.
    pub level: AlertLevel,
    /// Utilization at raise time (projected ratio for projections).
    pub utilization: f64,
    /// Spend in USD at raise time.
    pub spent_usd: f64,
    /// Ceiling in USD.
    pub ceiling_usd: f64,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

impl BudgetAlert {
    fn new(period: &BudgetPeriod, level: AlertLevel, utilization: f64, now: DateTime<Utc>) -> Self {
        Self {
            owner: period.owner.clone(),
            period: period.kind,
            level,
            utilization,
            spent_usd: micros_to_usd(period.spent_micros),
            ceiling_usd: micros_to_usd(period.ceiling_micros),
            raised_at: now,
        }
    }
}

/// Notifications published after each ledger mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    /// A debit landed. Carries both updated periods.
    Debited {
        /// Updated daily period.
        daily: BudgetPeriod,
        /// Updated monthly period.
        monthly: BudgetPeriod,
        /// Amount debited in micro-dollars.
        amount_micros: u64,
    },
    /// A period expired and was archived; `next` replaced it.
    RolledOver {
        /// The closed period.
        closed: BudgetPeriod,
        /// The freshly opened period.
        next: BudgetPeriod,
    },
    /// A threshold alert fired.
    Alert(BudgetAlert),
}

/// Outcome of a [`BudgetLedger::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Owners inspected.
    pub owners_checked: usize,
    /// Periods rolled over.
    pub rolled_over: usize,
    /// Projected-overrun alerts raised.
    pub projection_alerts: usize,
}

// ── Ledger ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Limits {
    daily: u64,
    monthly: u64,
    warning_at: f64,
}

#[derive(Debug)]
struct OwnerBook {
    daily: BudgetPeriod,
    monthly: BudgetPeriod,
}

impl OwnerBook {
    fn open(owner: &str, limits: Limits, now: DateTime<Utc>) -> Self {
        Self {
            daily: BudgetPeriod::open(owner, PeriodKind::Daily, limits.daily, now),
            monthly: BudgetPeriod::open(owner, PeriodKind::Monthly, limits.monthly, now),
        }
    }

    fn period_mut(&mut self, kind: PeriodKind) -> &mut BudgetPeriod {
        match kind {
            PeriodKind::Daily => &mut self.daily,
            PeriodKind::Monthly => &mut self.monthly,
        }
    }

    fn roll(&mut self, kind: PeriodKind, limits: Limits, now: DateTime<Utc>, out: &mut Vec<LedgerEvent>) {
        let ceiling = match kind {
            PeriodKind::Daily => limits.daily,
            PeriodKind::Monthly => limits.monthly,
        };
        let period = self.period_mut(kind);
        if !period.is_expired(now) {
            return;
        }
        let next = BudgetPeriod::open(&period.owner, kind, ceiling, now);
        let closed = std::mem::replace(period, next.clone());
        out.push(LedgerEvent::RolledOver { closed, next });
    }

    fn roll_all(&mut self, limits: Limits, now: DateTime<Utc>, out: &mut Vec<LedgerEvent>) {
        for kind in PeriodKind::ALL {
            self.roll(kind, limits, now, out);
        }
    }

    fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            daily: PeriodView::from(&self.daily),
            monthly: PeriodView::from(&self.monthly),
        }
    }
}

/// Per-owner daily and monthly spend tracking.
///
/// Owner books are created lazily on first use. Each book sits behind its own
/// `parking_lot::Mutex`, so owners never contend with each other.
pub struct BudgetLedger {
    books: DashMap<String, Arc<Mutex<OwnerBook>>>,
    config: RwLock<BudgetConfig>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<LedgerEvent>,
    archive: Mutex<VecDeque<BudgetPeriod>>,
    alerts: Mutex<VecDeque<BudgetAlert>>,
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("owners", &self.books.len())
            .field("config", &*self.config.read())
            .finish()
    }
}

impl BudgetLedger {
    /// Create an empty ledger.
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            books: DashMap::new(),
            config: RwLock::new(config),
            clock,
            events,
            archive: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Subscribe to ledger events.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Current configuration.
    pub fn config(&self) -> BudgetConfig {
        self.config.read().clone()
    }

    fn limits(&self, owner: &str) -> Limits {
        let config = self.config.read();
        Limits {
            daily: config.ceiling_micros(owner, PeriodKind::Daily),
            monthly: config.ceiling_micros(owner, PeriodKind::Monthly),
            warning_at: config.alert_threshold,
        }
    }

    fn book(&self, owner: &str, limits: Limits, now: DateTime<Utc>) -> Arc<Mutex<OwnerBook>> {
        if let Some(book) = self.books.get(owner) {
            return Arc::clone(book.value());
        }
        let book = self
            .books
            .entry(owner.to_string())
            .or_insert_with(|| {
                debug!(owner, "opening budget book");
                Arc::new(Mutex::new(OwnerBook::open(owner, limits, now)))
            });
        Arc::clone(book.value())
    }

    /// Run `decide` against the owner's current budget and debit the cost it
    /// returns, atomically.
    ///
    /// Expired periods are rolled over first, so `decide` always sees the
    /// current period. If `decide` fails nothing is debited.
    ///
    /// `decide` runs while the owner lock is held. It must be synchronous and
    /// must not call back into this ledger for the same owner.
    ///
    /// # Errors
    ///
    /// Propagates whatever `decide` returns.
    pub fn admit<T, F>(&self, owner: &str, decide: F) -> Result<T, RouterError>
    where
        F: FnOnce(&BudgetSnapshot) -> Result<(T, u64), RouterError>,
    {
        let limits = self.limits(owner);
        let now = self.clock.now();
        let book = self.book(owner, limits, now);
        let mut pending = Vec::new();

        let outcome = {
            let mut book = book.lock();
            book.roll_all(limits, now, &mut pending);
            let snapshot = book.snapshot();
            match decide(&snapshot) {
                Ok((value, cost)) => {
                    Self::debit_both(&mut book, cost, limits, now, &mut pending);
                    Ok(value)
                }
                Err(e) => Err(e),
            }
        };

        self.publish(pending);
        outcome
    }

    fn debit_both(
        book: &mut OwnerBook,
        amount: u64,
        limits: Limits,
        now: DateTime<Utc>,
        out: &mut Vec<LedgerEvent>,
    ) {
        let mut alerts = book.daily.record(amount, limits.warning_at, now);
        alerts.extend(book.monthly.record(amount, limits.warning_at, now));
        out.push(LedgerEvent::Debited {
            daily: book.daily.clone(),
            monthly: book.monthly.clone(),
            amount_micros: amount,
        });
        out.extend(alerts.into_iter().map(LedgerEvent::Alert));
    }

    /// Remaining budget for `owner` in `kind`, after any pending rollover.
    pub fn remaining(&self, owner: &str, kind: PeriodKind) -> u64 {
        self.current(owner, kind).remaining_micros()
    }

    /// The open period for `owner` in `kind`, after any pending rollover.
    pub fn current(&self, owner: &str, kind: PeriodKind) -> BudgetPeriod {
        let limits = self.limits(owner);
        let now = self.clock.now();
        let book = self.book(owner, limits, now);
        let mut pending = Vec::new();
        let period = {
            let mut book = book.lock();
            book.roll(kind, limits, now, &mut pending);
            book.period_mut(kind).clone()
        };
        self.publish(pending);
        period
    }

    /// Both periods for `owner`, after any pending rollover.
    pub fn snapshot(&self, owner: &str) -> BudgetSnapshot {
        let limits = self.limits(owner);
        let now = self.clock.now();
        let book = self.book(owner, limits, now);
        let mut pending = Vec::new();
        let snapshot = {
            let mut book = book.lock();
            book.roll_all(limits, now, &mut pending);
            book.snapshot()
        };
        self.publish(pending);
        snapshot
    }

    /// Record `amount_micros` against one period unconditionally and return
    /// the new period total.
    ///
    /// Routing uses [`admit`](Self::admit), which debits both periods; this
    /// is for manual adjustments.
    pub fn debit(&self, owner: &str, kind: PeriodKind, amount_micros: u64) -> u64 {
        let limits = self.limits(owner);
        let now = self.clock.now();
        let book = self.book(owner, limits, now);
        let mut pending = Vec::new();
        let total = {
            let mut book = book.lock();
            book.roll(kind, limits, now, &mut pending);
            let period = book.period_mut(kind);
            let alerts = period.record(amount_micros, limits.warning_at, now);
            let total = period.spent_micros;
            pending.push(LedgerEvent::Debited {
                daily: book.daily.clone(),
                monthly: book.monthly.clone(),
                amount_micros,
            });
            pending.extend(alerts.into_iter().map(LedgerEvent::Alert));
            total
        };
        self.publish(pending);
        total
    }

    /// Roll `kind` over for `owner` if its end boundary has passed.
    ///
    /// Returns the archived period when a rollover happened.
    pub fn reset_if_expired(&self, owner: &str, kind: PeriodKind) -> Option<BudgetPeriod> {
        let limits = self.limits(owner);
        let now = self.clock.now();
        let book = self.book(owner, limits, now);
        let mut pending = Vec::new();
        book.lock().roll(kind, limits, now, &mut pending);
        let closed = pending.iter().find_map(|e| match e {
            LedgerEvent::RolledOver { closed, .. } => Some(closed.clone()),
            _ => None,
        });
        self.publish(pending);
        closed
    }

    /// Roll over every expired period and raise projected-overrun alerts.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let books: Vec<(String, Arc<Mutex<OwnerBook>>)> = self
            .books
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut report = SweepReport {
            owners_checked: books.len(),
            ..SweepReport::default()
        };
        for (owner, book) in books {
            let limits = self.limits(&owner);
            let mut pending = Vec::new();
            {
                let mut book = book.lock();
                book.roll_all(limits, now, &mut pending);
                for kind in PeriodKind::ALL {
                    if let Some(alert) = book.period_mut(kind).projection_alert(now) {
                        pending.push(LedgerEvent::Alert(alert));
                    }
                }
            }
            for event in &pending {
                match event {
                    LedgerEvent::RolledOver { .. } => report.rolled_over += 1,
                    LedgerEvent::Alert(a) if a.level == AlertLevel::ProjectedOverrun => {
                        report.projection_alerts += 1
                    }
                    _ => {}
                }
            }
            self.publish(pending);
        }
        report
    }

    /// Replace the configuration and apply new ceilings to open periods.
    ///
    /// Spend is preserved.
    pub fn update_config(&self, config: BudgetConfig) {
        *self.config.write() = config;
        let books: Vec<(String, Arc<Mutex<OwnerBook>>)> = self
            .books
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (owner, book) in books {
            let limits = self.limits(&owner);
            let mut book = book.lock();
            book.daily.ceiling_micros = limits.daily;
            book.monthly.ceiling_micros = limits.monthly;
        }
        info!("budget configuration updated");
    }

    /// Install previously persisted periods.
    ///
    /// Periods that have already ended go straight to the archive. Ceilings
    /// are taken from the current configuration. Returns the number of open
    /// periods restored.
    pub fn restore(&self, periods: Vec<BudgetPeriod>) -> usize {
        let now = self.clock.now();
        let mut restored = 0;
        for mut period in periods {
            if period.is_expired(now) {
                self.archive_period(period);
                continue;
            }
            let kind = period.kind;
            let limits = self.limits(&period.owner);
            period.ceiling_micros = match kind {
                PeriodKind::Daily => limits.daily,
                PeriodKind::Monthly => limits.monthly,
            };
            let book = self.book(&period.owner, limits, now);
            let mut book = book.lock();
            *book.period_mut(kind) = period;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "restored budget periods");
        }
        restored
    }

    /// Every open period, ordered by owner then kind.
    pub fn periods(&self) -> Vec<BudgetPeriod> {
        let mut out: Vec<BudgetPeriod> = self
            .books
            .iter()
            .flat_map(|e| {
                let book = e.value().lock();
                [book.daily.clone(), book.monthly.clone()]
            })
            .collect();
        out.sort_by(|a, b| a.owner.cmp(&b.owner).then(a.kind.cmp(&b.kind)));
        out
    }

    /// Known owners.
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
        owners.sort();
        owners
    }

    /// Closed periods, oldest first.
    pub fn archived(&self) -> Vec<BudgetPeriod> {
        self.archive.lock().iter().cloned().collect()
    }

    /// Recently raised alerts, oldest first.
    pub fn recent_alerts(&self) -> Vec<BudgetAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    fn archive_period(&self, period: BudgetPeriod) {
        let capacity = self.config.read().archive_capacity;
        let mut archive = self.archive.lock();
        archive.push_back(period);
        while archive.len() > capacity {
            archive.pop_front();
        }
    }

    fn publish(&self, events: Vec<LedgerEvent>) {
        for event in events {
            match &event {
                LedgerEvent::RolledOver { closed, .. } => {
                    info!(
                        owner = %closed.owner,
                        period = %closed.kind,
                        spent_usd = micros_to_usd(closed.spent_micros),
                        debits = closed.debit_count,
                        "budget period rolled over"
                    );
                    self.archive_period(closed.clone());
                }
                LedgerEvent::Alert(alert) => {
                    warn!(
                        owner = %alert.owner,
                        period = %alert.period,
                        level = alert.level.as_str(),
                        utilization = alert.utilization,
                        spent_usd = alert.spent_usd,
                        ceiling_usd = alert.ceiling_usd,
                        "budget alert"
                    );
                    crate::metrics::record_budget_alert(alert.level.as_str(), alert.period.as_str());
                    let mut alerts = self.alerts.lock();
                    alerts.push_back(alert.clone());
                    while alerts.len() > ALERT_HISTORY_CAPACITY {
                        alerts.pop_front();
                    }
                }
                LedgerEvent::Debited { .. } => {}
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}
