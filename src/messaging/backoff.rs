//! Consecutive-timeout backoff for idle subscriptions
//!
//! Below the threshold an idle read is followed immediately by the next read.
//! From the threshold on the delay grows linearly:
//! `(consecutive_timeouts - threshold + 1) * base`, capped at `max`.

use std::time::Duration;

/// Consecutive timeouts tolerated before any delay is applied
pub const DEFAULT_IDLE_THRESHOLD: u32 = 5;

/// Delay step
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Tracks consecutive idle reads for one subscribe loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleBackoff {
    threshold: u32,
    base: Duration,
    max: Duration,
    consecutive_timeouts: u32,
}

impl IdleBackoff {
    pub fn new(threshold: u32, base: Duration, max: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            base,
            max,
            consecutive_timeouts: 0,
        }
    }

    /// Record one idle read and return the delay to apply before the next one
    pub fn record_timeout(&mut self) -> Option<Duration> {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);

        if self.consecutive_timeouts < self.threshold {
            return None;
        }

        let step = self.consecutive_timeouts - self.threshold + 1;
        Some(self.base.saturating_mul(step).min(self.max))
    }

    /// Any non-timeout outcome resets the counter
    pub fn reset(&mut self) {
        self.consecutive_timeouts = 0;
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_THRESHOLD, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay_below_threshold() {
        let mut backoff = IdleBackoff::default();
        for _ in 0..4 {
            assert_eq!(backoff.record_timeout(), None);
        }
        assert_eq!(backoff.consecutive_timeouts(), 4);
    }

    #[test]
    fn test_linear_growth_from_threshold() {
        let mut backoff = IdleBackoff::default();
        for _ in 0..4 {
            backoff.record_timeout();
        }

        assert_eq!(backoff.record_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.record_timeout(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.record_timeout(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_delay_is_non_decreasing_and_capped() {
        let mut backoff = IdleBackoff::default();
        let mut previous = Duration::ZERO;

        for _ in 0..200 {
            let delay = backoff.record_timeout().unwrap_or(Duration::ZERO);
            assert!(delay >= previous);
            assert!(delay <= DEFAULT_MAX_DELAY);
            previous = delay;
        }

        assert_eq!(previous, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_reset() {
        let mut backoff = IdleBackoff::default();
        for _ in 0..10 {
            backoff.record_timeout();
        }
        backoff.reset();

        assert_eq!(backoff.consecutive_timeouts(), 0);
        assert_eq!(backoff.record_timeout(), None);
    }

    #[test]
    fn test_counter_saturates() {
        let mut backoff = IdleBackoff {
            consecutive_timeouts: u32::MAX - 1,
            ..IdleBackoff::default()
        };

        assert_eq!(backoff.record_timeout(), Some(DEFAULT_MAX_DELAY));
        assert_eq!(backoff.record_timeout(), Some(DEFAULT_MAX_DELAY));
        assert_eq!(backoff.consecutive_timeouts(), u32::MAX);
    }
}
