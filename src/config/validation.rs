//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, the
//! mandatory `local` tier, unique tier ids).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::RouterConfig;
use crate::routing::TierId;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "budget.alert_threshold").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Tier table ───────────────────────────────────────────────────
    if !config.tiers.iter().any(|t| t.id == TierId::Local) {
        errors.push(invalid("tiers", "[..]", "the local tier must be defined"));
    }
    let mut seen = HashSet::new();
    for tier in &config.tiers {
        if !seen.insert(tier.id) {
            errors.push(invalid(
                "tiers.id",
                tier.id,
                "each tier may be defined at most once",
            ));
        }
        errors.extend(tier.validate().into_iter().map(ConfigError::Validation));
    }

    // ── Section validators ───────────────────────────────────────────
    errors.extend(
        config
            .budget
            .validate()
            .into_iter()
            .chain(config.tunables.validate())
            .chain(config.probe.validate())
            .chain(config.optimizer.validate())
            .map(ConfigError::Validation),
    );

    // ── Router section ───────────────────────────────────────────────
    if config.router.name.trim().is_empty() {
        errors.push(invalid("router.name", "", "router name must not be empty"));
    }
    if config.router.history_capacity == 0 {
        errors.push(invalid("router.history_capacity", 0, "must be at least 1"));
    }
    if config.router.max_prompt_chars == 0 {
        errors.push(invalid("router.max_prompt_chars", 0, "must be at least 1"));
    }

    // ── Estimator ────────────────────────────────────────────────────
    if config.estimator.chars_per_token == 0 {
        errors.push(invalid("estimator.chars_per_token", 0, "must be at least 1"));
    }
    let ratio = config.estimator.output_ratio;
    if !ratio.is_finite() || ratio < 0.0 {
        errors.push(invalid(
            "estimator.output_ratio",
            ratio,
            "must be a finite non-negative number",
        ));
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.ttl_secs == 0 {
        errors.push(invalid("cache.ttl_secs", 0, "must be at least 1 second"));
    }

    // ── Server ───────────────────────────────────────────────────────
    if config.server.max_request_size == 0 {
        errors.push(invalid("server.max_request_size", 0, "must be at least 1 byte"));
    }
    if config.server.timeout_seconds == 0 {
        errors.push(invalid("server.timeout_seconds", 0, "must be at least 1 second"));
    }

    // ── Persistence ──────────────────────────────────────────────────
    if config.persistence.flush_interval_ms == 0 {
        errors.push(invalid("persistence.flush_interval_ms", 0, "must be at least 1ms"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Tier;

    fn valid_config() -> RouterConfig {
        RouterConfig::default()
    }

    fn field_errors(config: &RouterConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .map(|e| match e {
                    ConfigError::InvalidField { field, .. } => field,
                    other => other.to_string(),
                })
                .collect(),
        }
    }

    // ── Valid config passes ──────────────────────────────────────────

    #[test]
    fn test_validate_default_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    // ── Tiers ────────────────────────────────────────────────────────

    #[test]
    fn test_validate_missing_local_fails() {
        let mut config = valid_config();
        config.tiers.retain(|t| t.id != TierId::Local);
        assert!(field_errors(&config).iter().any(|f| f == "tiers"));
    }

    #[test]
    fn test_validate_duplicate_tier_fails() {
        let mut config = valid_config();
        config.tiers.push(Tier::premium_default());
        assert!(field_errors(&config).iter().any(|f| f == "tiers.id"));
    }

    #[test]
    fn test_validate_negative_tier_rate_fails() {
        let mut config = valid_config();
        config.tiers[1].output_cost_per_1k = -0.1;
        let errors = field_errors(&config);
        assert!(errors.iter().any(|e| e.contains("output_cost_per_1k")));
    }

    #[test]
    fn test_validate_bad_health_url_fails() {
        let mut config = valid_config();
        config.tiers[2].health_url = Some("ftp://nope".into());
        assert!(field_errors(&config).iter().any(|e| e.contains("health_url")));
    }

    // ── Sections ─────────────────────────────────────────────────────

    #[test]
    fn test_validate_alert_threshold_above_one_fails() {
        let mut config = valid_config();
        config.budget.alert_threshold = 1.2;
        assert!(field_errors(&config)
            .iter()
            .any(|e| e.contains("alert_threshold")));
    }

    #[test]
    fn test_validate_negative_ceiling_fails() {
        let mut config = valid_config();
        config.budget.daily_ceiling_usd = -5.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_infinite_ceiling_passes() {
        let mut config = valid_config();
        config.budget.monthly_ceiling_usd = f64::INFINITY;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_balanced_fraction_fails() {
        let mut config = valid_config();
        config.tunables.balanced_budget_fraction = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_zero_chars_per_token_fails() {
        let mut config = valid_config();
        config.estimator.chars_per_token = 0;
        assert!(field_errors(&config)
            .iter()
            .any(|f| f == "estimator.chars_per_token"));
    }

    #[test]
    fn test_validate_zero_history_capacity_fails() {
        let mut config = valid_config();
        config.router.history_capacity = 0;
        assert!(field_errors(&config)
            .iter()
            .any(|f| f == "router.history_capacity"));
    }

    #[test]
    fn test_validate_empty_router_name_fails() {
        let mut config = valid_config();
        config.router.name = "  ".into();
        assert!(field_errors(&config).iter().any(|f| f == "router.name"));
    }

    #[test]
    fn test_validate_zero_cache_ttl_fails() {
        let mut config = valid_config();
        config.cache.ttl_secs = 0;
        assert!(field_errors(&config).iter().any(|f| f == "cache.ttl_secs"));
    }

    #[test]
    fn test_validate_zero_probe_interval_fails() {
        let mut config = valid_config();
        config.probe.interval_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut config = valid_config();
        config.router.history_capacity = 0;
        config.estimator.chars_per_token = 0;
        config.server.timeout_seconds = 0;
        let errors = validate(&config).err().unwrap_or_default();
        assert_eq!(errors.len(), 3);
    }

    // ── Display ──────────────────────────────────────────────────────

    #[test]
    fn test_config_error_invalid_field_display() {
        let err = invalid("budget.alert_threshold", 2.0, "must be in (0, 1]");
        let msg = err.to_string();
        assert!(msg.contains("budget.alert_threshold"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_config_error_io_display() {
        let err = ConfigError::Io {
            file: "router.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("router.toml"));
    }
}
