//! Live router tunables.
//!
//! [`RouterTunables`] is the part of the router's behaviour that may change
//! while serving: the default economic mode, the balanced-mode budget
//! fraction and the optimizer's feature flags. It is published through a
//! `tokio::sync::watch` channel so the request path reads a consistent
//! snapshot and the optimizer writes without locking the router.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::router::EconomicMode;

// ── Default value functions ────────────────────────────────────────────

fn default_balanced_budget_fraction() -> f64 {
    0.5
}

// ── RouterTunables ─────────────────────────────────────────────────────

/// Hot-swappable routing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RouterTunables {
    /// Mode used when a request does not name one.
    #[serde(default)]
    pub default_mode: EconomicMode,

    /// Balanced mode drops tiers whose estimate exceeds this fraction of the
    /// binding remaining budget.
    ///
    /// Range: `(0.0, 1.0]`.  Default: `0.5`.
    #[serde(default = "default_balanced_budget_fraction")]
    pub balanced_budget_fraction: f64,

    /// Serve repeated prompts from the decision cache at zero cost.
    #[serde(default)]
    pub caching_enabled: bool,

    /// Price requests with each tier's batch discount.
    #[serde(default)]
    pub batching_enabled: bool,

    /// Balanced mode orders surviving tiers cheapest-first instead of
    /// best-quality-first.
    #[serde(default)]
    pub prefer_cheaper_tiers: bool,
}

impl Default for RouterTunables {
    fn default() -> Self {
        Self {
            default_mode: EconomicMode::default(),
            balanced_budget_fraction: default_balanced_budget_fraction(),
            caching_enabled: false,
            batching_enabled: false,
            prefer_cheaper_tiers: false,
        }
    }
}

impl RouterTunables {
    /// Validate. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let f = self.balanced_budget_fraction;
        if !(f > 0.0 && f <= 1.0) {
            errors.push(format!(
                "tunables.balanced_budget_fraction must be in (0, 1], got {f}"
            ));
        }
        errors
    }
}

// ── TunablesHandle ─────────────────────────────────────────────────────

/// Shared handle to the live [`RouterTunables`].
///
/// Cloning is cheap; every clone sees the same channel.
///
/// # Panics
///
/// This type never panics.
#[derive(Clone)]
pub struct TunablesHandle {
    tx: watch::Sender<RouterTunables>,
    rx: watch::Receiver<RouterTunables>,
}

impl TunablesHandle {
    /// Create a handle holding `initial`.
    pub fn new(initial: RouterTunables) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self { tx, rx }
    }

    /// Current snapshot.
    pub fn current(&self) -> RouterTunables {
        self.rx.borrow().clone()
    }

    /// Receiver notified on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<RouterTunables> {
        self.rx.clone()
    }

    /// Apply `edit` and notify subscribers only if it reports a change.
    ///
    /// `edit` must return `true` exactly when it modified the value. Returns
    /// whatever `edit` returned.
    pub fn modify<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut RouterTunables) -> bool,
    {
        self.tx.send_if_modified(edit)
    }

    /// Replace the whole snapshot after validation.
    ///
    /// # Errors
    ///
    /// Returns the validation messages if `next` is invalid; the current
    /// value is left untouched.
    pub fn replace(&self, next: RouterTunables) -> Result<bool, Vec<String>> {
        let errors = next.validate();
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        }))
    }

    /// Set the default economic mode. Returns `true` if it changed.
    pub fn set_default_mode(&self, mode: EconomicMode) -> bool {
        self.modify(|t| {
            if t.default_mode == mode {
                false
            } else {
                t.default_mode = mode;
                true
            }
        })
    }
}

impl std::fmt::Debug for TunablesHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunablesHandle")
            .field("current", &*self.rx.borrow())
            .finish()
    }
}
