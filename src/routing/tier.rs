//! Execution tiers and the availability registry.
//!
//! A tier is a named execution backend with a per-1K-token price, a latency
//! class and a quality rank. The [`TierRegistry`] holds the static tier table
//! plus one availability flag per tier, written by the health prober and read
//! lock-free on the routing path.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::RouterError;

/// Identifier of an execution tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TierId {
    /// Self-hosted model. Always considered available.
    Local,
    /// Rented GPU capacity billed per token.
    Elastic,
    /// Hosted frontier API.
    Premium,
}

impl TierId {
    /// All tiers in ascending nominal cost order.
    pub const ALL: [TierId; 3] = [TierId::Local, TierId::Elastic, TierId::Premium];

    /// Lowercase name used in config, logs and metric labels.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Elastic => "elastic",
            Self::Premium => "premium",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Local => 0,
            Self::Elastic => 1,
            Self::Premium => 2,
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierId {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "elastic" => Ok(Self::Elastic),
            "premium" => Ok(Self::Premium),
            other => Err(RouterError::Configuration(format!("unknown tier '{other}'"))),
        }
    }
}

/// Coarse latency expectation for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    /// Sub-second first token.
    Interactive,
    /// Seconds.
    Standard,
    /// Queue-backed; minutes are acceptable.
    Batch,
}

fn default_latency_class() -> LatencyClass {
    LatencyClass::Standard
}

fn default_enabled() -> bool {
    true
}

/// Static description of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Tier {
    /// Which tier this row describes.
    pub id: TierId,
    /// Price per 1 000 input tokens, in USD.
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// Price per 1 000 output tokens, in USD.
    #[serde(default)]
    pub output_cost_per_1k: f64,
    /// Latency expectation.
    #[serde(default = "default_latency_class")]
    pub latency_class: LatencyClass,
    /// Higher is better. Only the relative order matters.
    pub quality_rank: u8,
    /// Endpoint polled by the health prober. Ignored for `local`.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Fraction taken off the estimate when batching is enabled, in `[0, 1)`.
    #[serde(default)]
    pub batch_discount: f64,
    /// Disabled tiers are dropped from the registry at startup.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Tier {
    /// Default self-hosted tier: free, lowest quality.
    pub fn local_default() -> Self {
        Self {
            id: TierId::Local,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            latency_class: LatencyClass::Standard,
            quality_rank: 1,
            health_url: None,
            batch_discount: 0.0,
            enabled: true,
        }
    }

    /// Default rented-GPU tier.
    pub fn elastic_default() -> Self {
        Self {
            id: TierId::Elastic,
            input_cost_per_1k: 0.0005,
            output_cost_per_1k: 0.0015,
            latency_class: LatencyClass::Standard,
            quality_rank: 2,
            health_url: None,
            batch_discount: 0.3,
            enabled: true,
        }
    }

    /// Default hosted frontier tier.
    pub fn premium_default() -> Self {
        Self {
            id: TierId::Premium,
            input_cost_per_1k: 0.003,
            output_cost_per_1k: 0.015,
            latency_class: LatencyClass::Interactive,
            quality_rank: 3,
            health_url: None,
            batch_discount: 0.5,
            enabled: true,
        }
    }

    /// The three default tiers.
    pub fn defaults() -> Vec<Tier> {
        vec![
            Self::local_default(),
            Self::elastic_default(),
            Self::premium_default(),
        ]
    }

    /// Validate a single row. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name = self.id.as_str();
        for (field, value) in [
            ("input_cost_per_1k", self.input_cost_per_1k),
            ("output_cost_per_1k", self.output_cost_per_1k),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!(
                    "tier {name}: {field} must be a finite non-negative number, got {value}"
                ));
            }
        }
        if !(0.0..1.0).contains(&self.batch_discount) {
            errors.push(format!(
                "tier {name}: batch_discount must be in [0, 1), got {}",
                self.batch_discount
            ));
        }
        if self.id == TierId::Local && !self.enabled {
            errors.push("tier local: cannot be disabled".into());
        }
        if let Some(url) = &self.health_url {
            if self.id == TierId::Local {
                errors.push("tier local: health_url is not allowed, local is never probed".into());
            } else if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!(
                    "tier {name}: health_url must start with http:// or https://, got '{url}'"
                ));
            }
        }
        errors
    }
}

/// The tier table plus live availability.
///
/// Availability is one [`AtomicBool`] per tier. `local` is pinned to
/// available; tiers missing from the table are pinned to unavailable.
#[derive(Debug)]
pub struct TierRegistry {
    tiers: Vec<Tier>,
    available: [AtomicBool; 3],
}

impl TierRegistry {
    /// Build a registry from configured tiers.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Configuration`] if `local` is missing, a tier
    /// appears twice, or any row fails [`Tier::validate`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(mut tiers: Vec<Tier>) -> Result<Self, RouterError> {
        tiers.sort_by_key(|t| t.id);
        let mut errors: Vec<String> = tiers.iter().flat_map(Tier::validate).collect();
        if tiers.windows(2).any(|w| w[0].id == w[1].id) {
            errors.push("each tier may be defined at most once".into());
        }
        if !tiers.iter().any(|t| t.id == TierId::Local) {
            errors.push("the local tier must be defined".into());
        }
        if !errors.is_empty() {
            return Err(RouterError::Configuration(errors.join("; ")));
        }
        tiers.retain(|t| t.enabled);

        let available = [
            AtomicBool::new(true),
            AtomicBool::new(tiers.iter().any(|t| t.id == TierId::Elastic)),
            AtomicBool::new(tiers.iter().any(|t| t.id == TierId::Premium)),
        ];
        Ok(Self { tiers, available })
    }

    /// Configured tiers, sorted by id.
    pub fn list_tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Look up a configured tier.
    pub fn get(&self, id: TierId) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Whether `id` can currently take traffic.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_available(&self, id: TierId) -> bool {
        id == TierId::Local || self.available[id.index()].load(Ordering::Acquire)
    }

    /// Set availability for `id`. Returns `true` if the flag changed.
    ///
    /// Writes to `local` and to unconfigured tiers are ignored.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn set_available(&self, id: TierId, available: bool) -> bool {
        if id == TierId::Local {
            return false;
        }
        if self.get(id).is_none() {
            warn!(tier = %id, "ignoring availability update for unconfigured tier");
            return false;
        }
        let previous = self.available[id.index()].swap(available, Ordering::AcqRel);
        if previous != available {
            if available {
                info!(tier = %id, "tier marked available");
            } else {
                warn!(tier = %id, "tier marked unavailable");
            }
            crate::metrics::set_tier_available(id.as_str(), available);
        }
        previous != available
    }

    /// Snapshot of `(tier, available)` for every configured tier.
    pub fn availability(&self) -> Vec<(TierId, bool)> {
        self.tiers
            .iter()
            .map(|t| (t.id, self.is_available(t.id)))
            .collect()
    }

    /// The configured tier with the lowest combined per-1K price.
    pub fn cheapest(&self) -> Option<TierId> {
        self.tiers
            .iter()
            .min_by(|a, b| {
                let ca = a.input_cost_per_1k + a.output_cost_per_1k;
                let cb = b.input_cost_per_1k + b.output_cost_per_1k;
                ca.total_cmp(&cb).then(a.id.cmp(&b.id))
            })
            .map(|t| t.id)
    }
}
