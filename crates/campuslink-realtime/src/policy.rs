//! Reconnection policy: capped exponential backoff with symmetric jitter.
//!
//! The math lives in [`campuslink_core::retry`]; this type owns the
//! parameters and the random source. Seeding the source makes the delay
//! sequence reproducible.

use std::time::Duration;

use campuslink_core::retry::{MaxAttempts, backoff_bounds, backoff_delay_with_random};
use campuslink_settings::LinkSettings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides whether to retry and how long to wait first.
#[derive(Clone, Debug)]
pub struct ReconnectionPolicy {
    max_attempts: MaxAttempts,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: f64,
    rng: StdRng,
}

impl ReconnectionPolicy {
    /// Policy with an OS-seeded random source.
    ///
    /// `jitter` is clamped to `0.0..=1.0` and `max_delay` is raised to
    /// `base_delay` if it is smaller.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(max_attempts: MaxAttempts, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        let base_delay_ms = base_delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: (max_delay.as_millis() as u64).max(base_delay_ms),
            jitter: jitter.clamp(0.0, 1.0),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Policy built from the reconnect section of the settings.
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self::new(
            settings.max_reconnect_attempts,
            settings.base_delay(),
            settings.max_delay(),
            settings.jitter_fraction,
        )
    }

    /// Replace the random source with a seeded one.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Configured attempt limit.
    pub fn max_attempts(&self) -> MaxAttempts {
        self.max_attempts
    }

    /// Whether attempt number `attempt` (one-based) may run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.allows(attempt)
    }

    /// Delay before attempt number `attempt` (one-based).
    ///
    /// Draws from the random source, so consecutive calls with the same
    /// attempt may differ unless jitter is zero.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let random: f64 = self.rng.random();
        Duration::from_millis(backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter,
            random,
        ))
    }

    /// Range every [`next_delay`](Self::next_delay) result for `attempt`
    /// falls in.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let (low, high) = backoff_bounds(attempt, self.base_delay_ms, self.max_delay_ms, self.jitter);
        (Duration::from_millis(low), Duration::from_millis(high))
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from_settings(&LinkSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(jitter: f64) -> ReconnectionPolicy {
        ReconnectionPolicy::new(
            MaxAttempts::Limited(5),
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            jitter,
        )
    }

    // -- attempts --

    #[test]
    fn retries_up_to_limit() {
        let p = policy(0.5);
        assert!(p.should_retry(1));
        assert!(p.should_retry(5));
        assert!(!p.should_retry(6));
    }

    #[test]
    fn unlimited_always_retries() {
        let p = ReconnectionPolicy::new(
            MaxAttempts::Unlimited,
            Duration::from_millis(100),
            Duration::from_millis(200),
            0.0,
        );
        assert!(p.should_retry(u32::MAX));
    }

    // -- delays --

    #[test]
    fn zero_jitter_is_pure_exponential() {
        let mut p = policy(0.0);
        let delays: Vec<u64> = (1..=5).map(|a| p.next_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn seeded_policies_agree() {
        let mut a = policy(0.5).with_seed(42);
        let mut b = policy(0.5).with_seed(42);
        for attempt in 1..=8 {
            assert_eq!(a.next_delay(attempt), b.next_delay(attempt));
        }
    }

    #[test]
    fn bounds_at_first_attempt() {
        let p = policy(0.5);
        assert_eq!(
            p.bounds(1),
            (Duration::from_millis(500), Duration::from_millis(1500))
        );
        // Upper bound capped at max delay.
        assert_eq!(
            p.bounds(4),
            (Duration::from_millis(2500), Duration::from_millis(5000))
        );
    }

    #[test]
    fn cap_below_base_is_raised() {
        let mut p = ReconnectionPolicy::new(
            MaxAttempts::Limited(1),
            Duration::from_millis(800),
            Duration::from_millis(100),
            0.0,
        );
        assert_eq!(p.next_delay(1), Duration::from_millis(800));
    }

    #[test]
    fn from_settings_uses_reconnect_fields() {
        let settings = LinkSettings {
            max_reconnect_attempts: MaxAttempts::Limited(2),
            base_delay_ms: 250,
            max_delay_ms: 1000,
            jitter_fraction: 0.0,
            ..LinkSettings::default()
        };
        let mut p = ReconnectionPolicy::from_settings(&settings);
        assert_eq!(p.max_attempts(), MaxAttempts::Limited(2));
        assert_eq!(p.next_delay(1), Duration::from_millis(250));
        assert_eq!(p.next_delay(3), Duration::from_millis(1000));
    }

    proptest! {
        #[test]
        fn delay_within_bounds(seed in any::<u64>(), attempt in 1u32..20, jitter in 0.0f64..=1.0) {
            let mut p = policy(jitter).with_seed(seed);
            let (low, high) = p.bounds(attempt);
            let delay = p.next_delay(attempt);
            prop_assert!(delay >= low && delay <= high, "{delay:?} not in {low:?}..={high:?}");
            prop_assert!(delay <= Duration::from_millis(5000));
        }
    }
}
