//! Reconnect backoff.

use std::time::Duration;

/// Bounded exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables reconnecting.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per retry, at least 1.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// Retry counter for one session.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    /// Delay before the next retry, or `None` when retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_attempts {
            return None;
        }
        self.retries += 1;
        Some(self.policy.delay_for(self.retries))
    }

    /// Starts over; called after a successful join.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Retries handed out since the last reset.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_runs_out_and_resets() {
        let mut backoff = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 3.0,
        }
        .backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.retries(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn disabled_policy_never_retries() {
        assert_eq!(RetryPolicy::disabled().backoff().next_delay(), None);
    }

    #[test]
    fn multiplier_below_one_is_treated_as_constant() {
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }
}
