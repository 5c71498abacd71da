//! Token and cost estimation.
//!
//! Money is carried as micro-dollars (`u64`, 1 USD = 1 000 000) everywhere a
//! value is accumulated, so long-running ledgers do not drift.

use serde::Serialize;

use super::tier::Tier;
use crate::RouterError;

/// Micro-dollars per USD.
pub const MICROS_PER_USD: u64 = 1_000_000;

/// Convert USD to micro-dollars.
///
/// Non-finite or negative input maps to `0`, except `+inf` which maps to
/// `u64::MAX` (an unlimited ceiling).
///
/// # Panics
///
/// This function never panics.
pub fn usd_to_micros(usd: f64) -> u64 {
    if usd == f64::INFINITY {
        return u64::MAX;
    }
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    // Float-to-int `as` saturates.
    (usd * MICROS_PER_USD as f64).round() as u64
}

/// Convert micro-dollars to USD.
///
/// # Panics
///
/// This function never panics.
pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD as f64
}

/// Estimated token counts for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenEstimate {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Expected completion tokens.
    pub output_tokens: u64,
}

impl TokenEstimate {
    /// Both directions summed.
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Turns a request payload into a token estimate.
///
/// Swappable so a real tokenizer can replace the character heuristic.
pub trait TokenEstimator: Send + Sync + std::fmt::Debug {
    /// Estimate tokens for `payload`.
    fn estimate(&self, payload: &str) -> TokenEstimate;
}

/// Character-ratio heuristic: `ceil(chars / chars_per_token)` input tokens and
/// `ceil(input * output_ratio)` output tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioEstimator {
    chars_per_token: u32,
    output_ratio: f64,
}

impl CharRatioEstimator {
    /// Create an estimator.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Configuration`] if `chars_per_token` is zero or
    /// `output_ratio` is negative or not finite.
    pub fn new(chars_per_token: u32, output_ratio: f64) -> Result<Self, RouterError> {
        if chars_per_token == 0 {
            return Err(RouterError::Configuration(
                "estimator.chars_per_token must be at least 1".into(),
            ));
        }
        if !output_ratio.is_finite() || output_ratio < 0.0 {
            return Err(RouterError::Configuration(format!(
                "estimator.output_ratio must be a finite non-negative number, got {output_ratio}"
            )));
        }
        Ok(Self {
            chars_per_token,
            output_ratio,
        })
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            output_ratio: 1.0,
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, payload: &str) -> TokenEstimate {
        let chars = payload.chars().count() as u64;
        let input_tokens = chars.div_ceil(u64::from(self.chars_per_token));
        let output_tokens = (input_tokens as f64 * self.output_ratio).ceil() as u64;
        TokenEstimate {
            input_tokens,
            output_tokens,
        }
    }
}

/// Estimated cost of running `tokens` on `tier`, in micro-dollars.
///
/// Rounds up so an estimate never undershoots the ledger.
///
/// # Panics
///
/// This function never panics.
pub fn estimate_cost(tier: &Tier, tokens: TokenEstimate) -> u64 {
    let input_rate = u128::from(usd_to_micros(tier.input_cost_per_1k));
    let output_rate = u128::from(usd_to_micros(tier.output_cost_per_1k));
    let scaled = u128::from(tokens.input_tokens) * input_rate
        + u128::from(tokens.output_tokens) * output_rate;
    u64::try_from(scaled.div_ceil(1000)).unwrap_or(u64::MAX)
}

/// Apply a batching discount to an estimate.
///
/// # Panics
///
/// This function never panics.
pub fn apply_batch_discount(cost_micros: u64, discount: f64) -> u64 {
    let discount = if discount.is_finite() {
        discount.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let off = (cost_micros as f64 * discount).floor() as u64;
    cost_micros.saturating_sub(off)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::tier::TierId;

    fn priced(input: f64, output: f64) -> Tier {
        Tier {
            id: TierId::Elastic,
            input_cost_per_1k: input,
            output_cost_per_1k: output,
            ..Tier::elastic_default()
        }
    }

    #[test]
    fn test_usd_micros_conversion() {
        assert_eq!(usd_to_micros(1.0), 1_000_000);
        assert_eq!(usd_to_micros(0.0005), 500);
        assert_eq!(usd_to_micros(-3.0), 0);
        assert_eq!(usd_to_micros(f64::NAN), 0);
        assert_eq!(usd_to_micros(f64::INFINITY), u64::MAX);
        assert!((micros_to_usd(2_500_000) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_char_ratio_rounds_up() {
        let est = CharRatioEstimator::default();
        let t = est.estimate("abcde");
        assert_eq!(t.input_tokens, 2);
        assert_eq!(t.output_tokens, 2);
    }

    #[test]
    fn test_empty_payload_is_zero_tokens() {
        let t = CharRatioEstimator::default().estimate("");
        assert_eq!(t, TokenEstimate::default());
    }

    #[test]
    fn test_estimator_counts_chars_not_bytes() {
        let est = CharRatioEstimator::new(1, 0.0).unwrap_or_default();
        assert_eq!(est.estimate("日本語").input_tokens, 3);
    }

    #[test]
    fn test_estimator_rejects_zero_chars_per_token() {
        assert!(CharRatioEstimator::new(0, 1.0).is_err());
        assert!(CharRatioEstimator::new(4, -0.5).is_err());
    }

    #[test]
    fn test_estimate_cost_combines_input_and_output_rates() {
        let tier = priced(0.001, 0.002);
        let cost = estimate_cost(
            &tier,
            TokenEstimate {
                input_tokens: 1000,
                output_tokens: 500,
            },
        );
        // 1000 * 1000/1000 + 500 * 2000/1000
        assert_eq!(cost, 2_000);
    }

    #[test]
    fn test_estimate_cost_rounds_fractional_micros_up() {
        let tier = priced(0.0005, 0.0);
        let cost = estimate_cost(
            &tier,
            TokenEstimate {
                input_tokens: 1,
                output_tokens: 0,
            },
        );
        assert_eq!(cost, 1);
    }

    #[test]
    fn test_free_tier_costs_zero() {
        let cost = estimate_cost(
            &Tier::local_default(),
            TokenEstimate {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
            },
        );
        assert_eq!(cost, 0);
    }

    #[test]
    fn test_batch_discount() {
        assert_eq!(apply_batch_discount(1_000, 0.3), 700);
        assert_eq!(apply_batch_discount(1_000, 0.0), 1_000);
        assert_eq!(apply_batch_discount(1_000, f64::NAN), 1_000);
        assert_eq!(apply_batch_discount(0, 0.5), 0);
    }
}
