//! Reconnection backoff policy

use std::time::Duration;

/// Exponential backoff used between signaling reconnection attempts
///
/// With the defaults the delays run 1s, 2s, 4s, 8s, 10s and the client gives
/// up after the fifth attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Number of attempts before giving up
    pub max_attempts: u32,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Returns true if another attempt is permitted after `attempts` tries
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Iterate over the full delay schedule
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = policy.schedule().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn test_attempt_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn test_large_attempt_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1_000), Duration::from_secs(10));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    }

    mod backoff_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delays_never_exceed_cap(attempt in 0u32..10_000, cap_ms in 1u64..60_000) {
                let policy = ReconnectPolicy {
                    max_delay: Duration::from_millis(cap_ms),
                    ..Default::default()
                };
                prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(cap_ms));
            }

            #[test]
            fn delays_are_monotonic(attempt in 1u32..64) {
                let policy = ReconnectPolicy::default();
                prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
            }
        }
    }
}
