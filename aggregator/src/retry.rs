//! Exponential backoff schedule for batch retries.

use std::time::Duration;

/// Capped exponential backoff parameters.
///
/// The delay for the k-th consecutive failure is
/// `min(initial_delay * factor^k, max_delay)`. The policy is a pure schedule:
/// how many attempts are made is the caller's business. The poller retries a
/// failing batch indefinitely (the delay just stops growing at the cap), and
/// bounds attempts only for the startup offset load.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from its parts.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
        }
    }

    /// Delay to sleep before retrying after `attempt` consecutive failures
    /// (zero-based: the first failure is attempt 0).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms = (self.initial_delay.as_millis() as f64
            * factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX)))
        .min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy::new(Duration::from_millis(1000), Duration::from_secs(2), 10.0);
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        // Stays at the cap forever, so retries never stop being scheduled.
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(2));
    }

    #[test]
    fn factor_below_one_does_not_shrink_delays() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 0.5);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
    }
}
