//! # Stage: Economic Tier Routing
//!
//! ## Responsibility
//! Decide, per inference request, which execution tier (local model, elastic
//! GPU pool, premium hosted API) serves it, under the requested economic mode
//! and the owner's remaining daily and monthly budget, and debit the estimate.
//!
//! ## Guarantees
//! - Atomic admission: the budget check and the debit for one owner happen in
//!   one critical section with no `.await` inside, so concurrent requests can
//!   never jointly overshoot a ceiling and an abandoned caller never leaves a
//!   debit behind.
//! - Closed modes: an unknown economic mode is a typed error, never coerced.
//! - Local fallback: `local` is always available, so losing every remote tier
//!   degrades routing but never fails it for availability reasons.
//! - Exact accounting: spend is carried in integer micro-dollars.
//!
//! ## NOT Responsible For
//! - Calling the model backends
//! - Background optimization (see [`crate::optimizer`])

pub mod cache;
pub mod estimator;
pub mod ledger;
pub mod probe;
pub mod router;
pub mod store;
pub mod tier;
pub mod tunables;
pub mod usage;

// Re-exports for convenience
pub use cache::{fingerprint, CacheStats, DecisionCache};
pub use estimator::{
    estimate_cost, micros_to_usd, usd_to_micros, CharRatioEstimator, TokenEstimate,
    TokenEstimator, MICROS_PER_USD,
};
pub use ledger::{
    AlertLevel, BudgetAlert, BudgetConfig, BudgetLedger, BudgetPeriod, BudgetSnapshot,
    LedgerEvent, OwnerBudget, PeriodKind, SweepReport,
};
pub use probe::{HealthProbe, HealthProber, HttpHealthProbe, ProbeConfig, ProbeError, StaticProbe};
pub use router::{
    Candidate, DecisionReason, EconomicMode, InferenceRequest, RoutingDecision, TaskType,
    TierRouter,
};
pub use store::{JsonFileStore, LedgerStore, MemoryStore, PersistenceConfig, StoreError};
pub use tier::{LatencyClass, Tier, TierId, TierRegistry};
pub use tunables::{RouterTunables, TunablesHandle};
pub use usage::{TierUsage, UsageSnapshot, UsageTracker};
