//! Exponential backoff between retry attempts on the same source.

use std::time::Duration;

/// Delay schedule consulted by the orchestrator after a failed attempt.
///
/// The delay after attempt `n` (1-based) is `base_delay * multiplier^(n-1)`,
/// optionally capped at `max_delay`. With the defaults that is 3s, 9s, 27s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    multiplier: u32,
    max_delay: Option<Duration>,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: u32) -> Self {
        Self {
            base_delay,
            multiplier: multiplier.max(1),
            max_delay: None,
        }
    }

    /// No waiting between attempts.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self
            .multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_powers_of_three() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(3));
        assert_eq!(policy.delay_after(2), Duration::from_secs(9));
        assert_eq!(policy.delay_after(3), Duration::from_secs(27));
    }

    #[test]
    fn cap_limits_growth() {
        let policy = BackoffPolicy::default().with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(9));
        assert_eq!(policy.delay_after(3), Duration::from_secs(10));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(200), Duration::MAX);
    }

    #[test]
    fn zero_multiplier_is_treated_as_constant() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), 0);
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(4), Duration::from_millis(250));
    }

    #[test]
    fn none_never_waits() {
        let policy = BackoffPolicy::none();
        assert_eq!(policy.delay_after(5), Duration::ZERO);
    }
}
