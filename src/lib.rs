//! # economic-router
//!
//! A budget-aware admission controller that routes inference requests across
//! a small set of execution tiers (`local`, `elastic`, `premium`).
//!
//! ## Architecture
//!
//! ```text
//! request ─▶ TokenEstimator ─▶ TierRouter ──(per-owner lock)──▶ BudgetLedger debit
//!                 │                 ▲                                  │
//!            TierRegistry ◀── HealthProbe            OptimizationMonitor (timers)
//!                                   ▲                                  │
//!                                   └────── RouterTunables (watch) ◀───┘
//! ```
//!
//! [`orchestrator::EconomicRouter`] is the explicitly constructed owner of the
//! whole path; there is no global router instance.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod clock;
pub mod config;
pub mod metrics;
pub mod optimizer;
pub mod orchestrator;
pub mod routing;

#[cfg(feature = "web-api")]
pub mod web_api;

pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{EconomicRouter, RouteRequest};
pub use routing::{
    BudgetLedger, EconomicMode, InferenceRequest, PeriodKind, RoutingDecision, TaskType, TierId,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level router errors.
///
/// Anything the per-request path can recover from by trying the next tier is
/// handled inside the router; every variant here reaches the caller as a
/// typed refusal.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Malformed tier definition or invalid startup configuration.
    ///
    /// Fatal at startup: the router refuses to serve traffic.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An economic mode outside `cost_optimized | balanced | performance`.
    #[error(
        "configuration error: unknown economic mode '{0}' \
         (expected cost_optimized, balanced or performance)"
    )]
    InvalidMode(String),

    /// No tier fits the binding budget in a mode that enforces hard ceilings.
    #[error(
        "budget exceeded for owner '{owner}': cheapest candidate costs ${required_usd:.6}, \
         {period} budget has ${remaining_usd:.6} remaining"
    )]
    BudgetExceeded {
        /// Owner (project) whose ledger refused the request.
        owner: String,
        /// The period whose remaining budget was binding.
        period: routing::PeriodKind,
        /// Estimated cost of the cheapest available candidate, in USD.
        required_usd: f64,
        /// Remaining budget in the binding period, in USD.
        remaining_usd: f64,
    },

    /// A tier could not serve the request; retryable on another tier.
    #[error("tier unavailable: {0}")]
    TierUnavailable(String),

    /// The request payload could not be turned into a token estimate.
    #[error("estimation error: {0}")]
    Estimation(String),

    /// The background optimization pass failed; never surfaced to routing.
    #[error("optimization cycle failed: {0}")]
    OptimizationCycle(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl RouterError {
    /// Stable snake_case code for this error, used in API bodies and metric
    /// labels.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::InvalidMode(_) => "invalid_mode",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::TierUnavailable(_) => "tier_unavailable",
            Self::Estimation(_) => "invalid_request",
            Self::OptimizationCycle(_) => "optimization_cycle_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// Return `true` if the caller may retry the same request unchanged.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TierUnavailable(_))
    }
}

impl From<config::validation::ConfigError> for RouterError {
    fn from(e: config::validation::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}
