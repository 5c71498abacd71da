//! # Stage: Router Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML file that describes the tier
//! table, budget ceilings, routing tunables, optimizer thresholds, probe
//! schedule, HTTP server and ledger persistence:
//! ```text
//! economic-router --config router.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Complete defaults: an empty file is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Applying a reloaded config to a running router (that belongs to
//!   `EconomicRouter::apply_config`)

pub mod loader;
pub mod validation;
pub mod watcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::optimizer::OptimizerConfig;
use crate::routing::{BudgetConfig, PersistenceConfig, ProbeConfig, RouterTunables, Tier};

// ── Default value functions ──────────────────────────────────────────────

fn default_router_name() -> String {
    "economic-router".to_string()
}

/// Default decision history kept for the optimizer.
fn default_history_capacity() -> usize {
    10_000
}

/// Default largest accepted prompt, in characters.
fn default_max_prompt_chars() -> usize {
    400_000
}

fn default_chars_per_token() -> u32 {
    4
}

fn default_output_ratio() -> f64 {
    1.0
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Default request body limit: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_timeout_seconds() -> u64 {
    30
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one router process.
///
/// Every section is optional; an empty document yields [`RouterConfig::default`].
///
/// # Example
///
/// ```toml
/// [budget]
/// daily_ceiling_usd = 25.0
/// monthly_ceiling_usd = 500.0
///
/// [[tiers]]
/// id = "local"
/// quality_rank = 1
///
/// [[tiers]]
/// id = "premium"
/// input_cost_per_1k = 0.003
/// output_cost_per_1k = 0.015
/// quality_rank = 3
/// health_url = "https://api.example.com/health"
///
/// [tunables]
/// default_mode = "cost_optimized"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Process identity and request limits.
    #[serde(default)]
    pub router: RouterSection,
    /// Execution tiers. Must include `local`.
    #[serde(default = "Tier::defaults")]
    pub tiers: Vec<Tier>,
    /// Daily and monthly ceilings.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Live routing knobs.
    #[serde(default)]
    pub tunables: RouterTunables,
    /// Token estimation heuristic.
    #[serde(default)]
    pub estimator: EstimatorConfig,
    /// Decision cache sizing.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Tier health probing.
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Optimization monitor.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Ledger persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router: RouterSection::default(),
            tiers: Tier::defaults(),
            budget: BudgetConfig::default(),
            tunables: RouterTunables::default(),
            estimator: EstimatorConfig::default(),
            cache: CacheConfig::default(),
            probe: ProbeConfig::default(),
            optimizer: OptimizerConfig::default(),
            server: ServerConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Process identity and request limits.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterSection {
    /// Name reported in logs and `/health`.
    #[serde(default = "default_router_name")]
    pub name: String,
    /// Admitted decisions retained for the optimizer.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Prompts longer than this many characters are rejected.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            name: default_router_name(),
            history_capacity: default_history_capacity(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

/// Character-ratio token heuristic.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EstimatorConfig {
    /// Characters per input token.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u32,
    /// Expected output tokens per input token.
    #[serde(default = "default_output_ratio")]
    pub output_ratio: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            output_ratio: default_output_ratio(),
        }
    }
}

/// Decision cache sizing.
///
/// Whether the cache is consulted is the `tunables.caching_enabled` flag.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum cached fingerprints.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Seconds a cached decision stays valid.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// HTTP server settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Export the JSON Schema for `RouterConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
