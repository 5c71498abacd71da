//! # Tier Health Prober
//!
//! ## Responsibility
//!
//! Polls every configured non-local tier on an interval and writes the result
//! into the [`TierRegistry`] availability flags.
//!
//! ## Guarantees
//!
//! - **Off the request path**: probes run in a background task; the router
//!   only ever reads the cached flags.
//! - **Non-panicking**: every error path is logged and retried next tick.
//! - **Local is never probed**: it is pinned available by the registry.
//!
//! ## NOT Responsible For
//!
//! - Retrying failed inference calls (callers report transport failures via
//!   `EconomicRouter::report_tier_failure`)

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::tier::{Tier, TierId, TierRegistry};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Connection, TLS or timeout failure.
    #[error("probe transport error: {0}")]
    Transport(String),
    /// The endpoint answered with a non-2xx status.
    #[error("probe returned HTTP {0}")]
    Status(u16),
    /// The probe reported the tier down without an HTTP exchange.
    #[error("tier reported unhealthy")]
    Unhealthy,
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn default_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    1
}

/// Health probe schedule and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive failures before a tier is marked unavailable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl ProbeConfig {
    /// Validate. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.interval_secs == 0 {
            errors.push("probe.interval_secs must be at least 1".into());
        }
        if self.request_timeout_ms == 0 {
            errors.push("probe.request_timeout_ms must be at least 1".into());
        }
        if self.failure_threshold == 0 {
            errors.push("probe.failure_threshold must be at least 1".into());
        }
        errors
    }
}

// ── Probe seam ────────────────────────────────────────────────────────────────

/// Checks whether one tier can take traffic.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `tier`. `Ok(())` means healthy.
    async fn probe(&self, tier: &Tier) -> Result<(), ProbeError>;
}

/// HTTP `GET health_url`, healthy on any 2xx.
///
/// A tier without a `health_url` is taken as healthy: there is nothing to
/// check and only transport failures reported by callers can take it down.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Build a probe with the configured timeouts.
    ///
    /// # Panics
    /// This function never panics.
    pub fn new(config: &ProbeConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, tier: &Tier) -> Result<(), ProbeError> {
        let Some(url) = tier.health_url.as_deref() else {
            return Ok(());
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(resp.status().as_u16()))
        }
    }
}

/// In-process probe whose answers are set by hand.
///
/// Every tier starts healthy.
#[derive(Debug)]
pub struct StaticProbe {
    healthy: [AtomicBool; 3],
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            healthy: [
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
            ],
        }
    }
}

impl StaticProbe {
    /// All tiers healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what the next probe of `tier` will report.
    pub fn set_healthy(&self, tier: TierId, healthy: bool) {
        self.healthy[tier.index()].store(healthy, Ordering::Release);
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, tier: &Tier) -> Result<(), ProbeError> {
        if self.healthy[tier.id.index()].load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy)
        }
    }
}

// ── Prober ────────────────────────────────────────────────────────────────────

/// Background task that keeps registry availability current.
pub struct HealthProber {
    registry: Arc<TierRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: ProbeConfig,
    failures: [AtomicU32; 3],
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("config", &self.config)
            .finish()
    }
}

impl HealthProber {
    /// Create a prober.
    pub fn new(registry: Arc<TierRegistry>, probe: Arc<dyn HealthProbe>, config: ProbeConfig) -> Self {
        Self {
            registry,
            probe,
            config,
            failures: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Probe every non-local tier once, concurrently, and update the registry.
    ///
    /// Returns `(tier, healthy)` for each tier probed.
    pub async fn probe_once(&self) -> Vec<(TierId, bool)> {
        let targets: Vec<&Tier> = self
            .registry
            .list_tiers()
            .iter()
            .filter(|t| t.id != TierId::Local)
            .collect();

        let results = join_all(targets.iter().map(|tier| async move {
            (tier.id, self.probe.probe(tier).await)
        }))
        .await;

        results
            .into_iter()
            .map(|(id, result)| {
                let healthy = self.apply(id, result);
                (id, healthy)
            })
            .collect()
    }

    fn apply(&self, id: TierId, result: Result<(), ProbeError>) -> bool {
        let counter = &self.failures[id.index()];
        match result {
            Ok(()) => {
                counter.store(0, Ordering::Relaxed);
                trace!(tier = %id, "probe ok");
                self.registry.set_available(id, true);
                true
            }
            Err(e) => {
                let failures = counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                warn!(tier = %id, error = %e, consecutive_failures = failures, "tier probe failed");
                if failures >= self.config.failure_threshold {
                    self.registry.set_available(id, false);
                }
                crate::metrics::record_probe_failure(id.as_str());
                false
            }
        }
    }

    /// Run probe rounds until `shutdown` flips to `true` or its sender drops.
    ///
    /// # Panics
    /// This function never panics.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "tier health prober started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = self.probe_once().await;
                    debug!(?results, "probe round complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("tier health prober stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
