//! Exponential retry backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry backoff: `min(initial * multiplier^attempt, max)`.
///
/// `attempt` is zero-based: the wait before the second delivery of an entry
/// is `delay(0)`. Consumers derive it from the store's delivery count
/// (`delivery_count - 1`), never from a local counter.
///
/// The policy is pure and non-decreasing in `attempt`: multipliers below
/// `1.0` are clamped to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBackoffPolicy")]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

/// Wire shape of `BackoffPolicy`; decoding goes through `BackoffPolicy::new`.
#[derive(Deserialize)]
struct RawBackoffPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl From<RawBackoffPolicy> for BackoffPolicy {
    fn from(raw: RawBackoffPolicy) -> Self {
        Self::new(raw.initial, raw.multiplier, raw.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Constant delay between retries.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, 1.0, delay)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_nan() {
            return self.initial.min(self.max);
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max),
            // Only +inf or values past `Duration::MAX` get here, both above the cap.
            Err(_) => self.max,
        }
    }

    /// Wait before redelivering an entry the store has delivered
    /// `delivery_count` times.
    pub fn delay_for_delivery(&self, delivery_count: u64) -> Duration {
        let attempt = delivery_count.saturating_sub(1);
        self.delay(u32::try_from(attempt).unwrap_or(u32::MAX))
    }

    /// Idle time after which a peer's pending entry counts as abandoned:
    /// `max(floor, 2 * max)`.
    pub fn reclaim_threshold(&self, floor: Duration) -> Duration {
        floor.max(self.max.saturating_mul(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(10))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn caps_at_max() {
        let p = policy();
        assert_eq!(p.delay(7), Duration::from_secs(10));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let p = BackoffPolicy::fixed(Duration::from_millis(500));
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(9), Duration::from_millis(500));
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let p = BackoffPolicy::new(Duration::from_millis(100), 0.5, Duration::from_secs(1));
        assert_eq!(p.multiplier(), 1.0);
        assert_eq!(p.delay(4), Duration::from_millis(100));
    }

    #[test]
    fn zero_initial_stays_zero_for_any_attempt() {
        let p = BackoffPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(60));
        assert_eq!(p.delay(0), Duration::ZERO);
        assert_eq!(p.delay(1100), Duration::ZERO);
        assert_eq!(p.delay(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn deserialized_policy_is_clamped_like_new() {
        let json = r#"{
            "initial": {"secs": 0, "nanos": 100000000},
            "multiplier": 0.5,
            "max": {"secs": 1, "nanos": 0}
        }"#;
        let p: BackoffPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(p.multiplier(), 1.0);
        assert_eq!(p.delay(4), Duration::from_millis(100));

        let encoded = serde_json::to_string(&policy()).unwrap();
        let decoded: BackoffPolicy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, policy());
    }

    #[test]
    fn delivery_count_maps_to_zero_based_attempt() {
        let p = policy();
        assert_eq!(p.delay_for_delivery(1), p.delay(0));
        assert_eq!(p.delay_for_delivery(2), p.delay(1));
        assert_eq!(p.delay_for_delivery(0), p.delay(0));
    }

    #[test]
    fn reclaim_threshold_has_a_floor() {
        let p = policy();
        assert_eq!(
            p.reclaim_threshold(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
        assert_eq!(
            p.reclaim_threshold(Duration::from_secs(5)),
            Duration::from_secs(20)
        );
    }

    proptest! {
        #[test]
        fn matches_formula(
            initial_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 1u64..600_000,
            attempt in 0u32..40,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(max_ms),
            );
            let expected = (initial_ms as f64 / 1000.0) * multiplier.powi(attempt as i32);
            let expected = expected.min(max_ms as f64 / 1000.0);
            let got = p.delay(attempt).as_secs_f64();
            prop_assert!((got - expected).abs() < 1e-6);
        }

        #[test]
        fn is_non_decreasing(
            initial_ms in 0u64..5_000,
            multiplier in 0.0f64..8.0,
            max_ms in 0u64..600_000,
            attempt in 0u32..200,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(max_ms),
            );
            prop_assert!(p.delay(attempt) <= p.delay(attempt + 1));
            prop_assert!(p.delay(attempt) <= p.max());
        }

        #[test]
        fn large_attempts_respect_formula(
            initial_ms in 0u64..3,
            multiplier in 1.0f64..16.0,
            max_ms in 0u64..600_000,
            attempt in 0u32..5_000,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(max_ms),
            );
            let got = p.delay(attempt);
            if initial_ms == 0 {
                prop_assert_eq!(got, Duration::ZERO);
            } else {
                let expected = (initial_ms as f64 / 1000.0) * multiplier.powi(attempt as i32);
                let expected = expected.min(max_ms as f64 / 1000.0);
                prop_assert!((got.as_secs_f64() - expected).abs() < 1e-6);
            }
            prop_assert!(got <= p.delay(attempt.saturating_add(1)));
        }
    }
}
