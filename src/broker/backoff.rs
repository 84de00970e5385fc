//! Retry delay computation for the reconnect loop
//!
//! Exponential growth with a cap, plus symmetric jitter so a fleet of
//! services does not hammer a restarting broker in lockstep.

use crate::config::BrokerSection;
use rand::Rng;
use std::time::Duration;

/// Computes the delay before the next connect attempt
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    /// Symmetric jitter fraction applied to the capped delay
    jitter: f64,
}

impl BackoffPolicy {
    /// Create a policy with the standard ±10% jitter
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Build the policy from a broker configuration section
    pub fn from_section(section: &BrokerSection) -> Self {
        Self::new(section.initial_retry_delay(), section.max_retry_delay())
    }

    /// Capped exponential delay before jitter: `min(initial * 2^(attempt-1), max)`
    ///
    /// `attempt` is 1-indexed; 0 is a caller error and is clamped to 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1, "attempt counter is 1-indexed");
        let exponent = attempt.max(1) - 1;
        let initial_ms = self.initial_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        // Shifting past 63 bits or saturating both mean we are over the cap
        let raw_ms = match 1u64.checked_shl(exponent) {
            Some(factor) => initial_ms.saturating_mul(factor),
            None => u64::MAX,
        };
        Duration::from_millis(raw_ms.min(max_ms))
    }

    /// Delay for the given attempt with ±10% jitter applied
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay using a caller-supplied RNG; deterministic when the
    /// RNG is seeded
    pub fn next_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let delta = base.as_secs_f64() * self.jitter;
        let low = (base.as_secs_f64() - delta).max(0.0);
        let high = base.as_secs_f64() + delta;
        Duration::from_secs_f64(rng.gen_range(low..=high))
    }
}

/// Attempt counter for one connect cycle
///
/// Reset on every successful connect; never persisted.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt: u32,
    last_delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and compute the delay before the next one
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        self.attempt += 1;
        self.last_delay = policy.next_delay(self.attempt);
        self.last_delay
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay computed for the most recent failure
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy_ms(initial: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(initial), Duration::from_millis(max))
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let policy = policy_ms(100, 400);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(400)); // capped
        assert_eq!(policy.base_delay(50), Duration::from_millis(400)); // capped
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = policy_ms(1000, 30000);
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(30000));
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let policy = policy_ms(1000, 30000);
        let a = policy.next_delay_with_rng(3, &mut StdRng::seed_from_u64(42));
        let b = policy.next_delay_with_rng(3, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_jittered_delays_vary() {
        let policy = policy_ms(1000, 30000);
        let delays: Vec<_> = (0..10).map(|_| policy.next_delay(3)).collect();
        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jittered delays should vary");
    }

    #[test]
    fn test_retry_state_counts_and_resets() {
        let policy = policy_ms(50, 200);
        let mut retry = RetryState::new();
        assert_eq!(retry.attempts(), 0);

        let first = retry.record_failure(&policy);
        assert_eq!(retry.attempts(), 1);
        assert_eq!(retry.last_delay(), first);

        retry.record_failure(&policy);
        assert_eq!(retry.attempts(), 2);

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        assert_eq!(retry.last_delay(), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_ten_percent_of_base(
            attempt in 1u32..=64,
            initial_ms in 10u64..=5_000,
            cap_factor in 1u64..=64,
            seed in any::<u64>(),
        ) {
            let max_ms = initial_ms * cap_factor;
            let policy = policy_ms(initial_ms, max_ms);
            let base = policy.base_delay(attempt).as_secs_f64();
            let delay = policy
                .next_delay_with_rng(attempt, &mut StdRng::seed_from_u64(seed))
                .as_secs_f64();

            // Small epsilon for the f64 round trip through from_secs_f64
            prop_assert!(delay >= base * 0.9 - 1e-9);
            prop_assert!(delay <= base * 1.1 + 1e-9);
        }
    }
}
