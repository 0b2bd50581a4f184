//! # Exponential Backoff
//!
//! Per-item retry delays for the work queue. Each failure doubles the delay,
//! starting at the base and capped at the maximum.
//! Default sequence: 5ms, 10ms, 20ms, 40ms ... 1000s (max).

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_BASE: Duration = Duration::from_millis(5);
/// Default retry delay cap
pub const DEFAULT_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given first delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, current: base, max }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Delay for the given number of prior failures (stateless)
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        let factor = 2u32.checked_pow(error_count).unwrap_or(u32::MAX);
        std::cmp::min(base.saturating_mul(factor), max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

/// Backoff state for a work item
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.error_count += 1;
        self.backoff.next_backoff()
    }

    /// Consecutive failures since the last reset
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Forget all failures
    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(20));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        // 8s would exceed the cap
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::default();

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        assert_eq!(backoff.next_backoff(), DEFAULT_BASE);
    }

    #[test]
    fn test_calculate_for_error_count() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(ExponentialBackoff::calculate_for_error_count(0, base, max), base);
        assert_eq!(ExponentialBackoff::calculate_for_error_count(3, base, max), Duration::from_millis(40));
        assert_eq!(ExponentialBackoff::calculate_for_error_count(40, base, max), max);
    }

    #[test]
    fn test_backoff_state_counts_errors() {
        let mut state = BackoffState::default();
        state.next_delay();
        state.next_delay();
        assert_eq!(state.error_count(), 2);
        state.reset();
        assert_eq!(state.error_count(), 0);
    }
}
