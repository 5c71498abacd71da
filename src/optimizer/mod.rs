//! # Stage: Optimization Monitor
//!
//! ## Responsibility
//! Periodically review routing spend, flag cost spikes and inefficient tier
//! usage, propose savings, and flip the router's tunables for the proposals
//! that are allowed to apply themselves. A second, faster cadence sweeps the
//! budget ledger for expired periods and projected overruns.
//!
//! ## Guarantees
//! - Off the request path: the monitor only reads spend and writes tunables
//! - Idempotent: applying the same proposal twice changes nothing the second
//!   time and does not count its savings again
//! - Failure-isolated: a failed pass is logged and skipped, never propagated
//!
//! ## NOT Responsible For
//! - Routing or debiting (see [`crate::routing`])

pub mod analysis;
pub mod monitor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::RouterError;

pub use analysis::{
    analyze, Analysis, AutoApplyConfig, CostSpike, DaySnapshot, Inefficiency,
    OptimizationAction, OptimizerConfig, Proposal, RecommendationCategory, SpendWindow,
    TierSpend, TrendWindow,
};
pub use monitor::{MonitorStats, OptimizationMonitor, PassReport, Recommendation};

/// Where the monitor reads spend from.
#[async_trait]
pub trait SpendSource: Send + Sync {
    /// Aggregate admitted decisions made at or after `since`.
    ///
    /// # Errors
    ///
    /// Any error skips the current pass.
    async fn spend_since(&self, since: DateTime<Utc>) -> Result<SpendWindow, RouterError>;
}
