//! Reconnect budget and backoff calculation.
//!
//! Provides the portable, sync-only building blocks for reconnection. The
//! stateful policy (seeded randomness, attempt bookkeeping) lives in
//! `campuslink-realtime`; this module only holds the math:
//!
//! - [`MaxAttempts`]: finite or unlimited retry budget
//! - [`exponential_delay_ms`]: capped `base * 2^(attempt-1)`
//! - [`backoff_delay_with_random`]: exponential backoff with symmetric jitter
//! - [`backoff_bounds`]: the closed interval a jittered delay falls in

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ─────────────────────────────────────────────────────────────────────────────
// Retry budget
// ─────────────────────────────────────────────────────────────────────────────

/// How many failed attempts the supervisor tolerates before giving up.
///
/// Serialized as a plain integer, or the string `"unlimited"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxAttempts {
    /// Retry while `attempt <= n`.
    Limited(u32),
    /// Never give up.
    Unlimited,
}

impl MaxAttempts {
    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn allows(self, attempt: u32) -> bool {
        match self {
            Self::Limited(max) => attempt <= max,
            Self::Unlimited => true,
        }
    }
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self::Limited(5)
    }
}

impl fmt::Display for MaxAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for MaxAttempts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxAttempts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MaxAttemptsVisitor;

        impl Visitor<'_> for MaxAttemptsVisitor {
            type Value = MaxAttempts;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MaxAttempts, E> {
                u32::try_from(v)
                    .map(MaxAttempts::Limited)
                    .map_err(|_| E::custom(format!("attempt budget {v} is too large")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<MaxAttempts, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom("attempt budget must not be negative"))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<MaxAttempts, E> {
                if v.eq_ignore_ascii_case("unlimited") {
                    Ok(MaxAttempts::Unlimited)
                } else {
                    v.parse::<u32>()
                        .map(MaxAttempts::Limited)
                        .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(MaxAttemptsVisitor)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Capped exponential delay for a one-based attempt number.
///
/// Formula: `min(max_delay, base_delay * 2^(attempt - 1))`. Attempt `0` is
/// treated as attempt `1`.
#[must_use]
pub fn exponential_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(max_delay_ms)
}

/// Calculate backoff delay with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0]` from a PRNG. It is mapped to a
/// multiplier in `[1 - jitter, 1 + jitter]`. The jittered value never
/// exceeds `max_delay_ms`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let capped = exponential_delay_ms(attempt, base_delay_ms, max_delay_ms);
    let jitter = jitter_factor.clamp(0.0, 1.0);

    // Maps random [0,1] to [-jitter, +jitter]
    let multiplier = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
    let with_jitter = (capped as f64) * multiplier;

    (with_jitter.round().max(0.0) as u64).min(max_delay_ms)
}

/// Closed interval `[low, high]` in which a jittered delay for `attempt`
/// falls.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_bounds(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> (u64, u64) {
    let capped = exponential_delay_ms(attempt, base_delay_ms, max_delay_ms) as f64;
    let jitter = jitter_factor.clamp(0.0, 1.0);
    let low = (capped * (1.0 - jitter)).round().max(0.0) as u64;
    let high = ((capped * (1.0 + jitter)).round() as u64).min(max_delay_ms);
    (low.min(high), high)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
