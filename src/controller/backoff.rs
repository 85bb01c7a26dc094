//! # Fibonacci Backoff
//!
//! Per-resource backoff for reconciliations that return an error (store or workspace
//! failures that could not be recorded in status). Recorded failures use the fixed
//! failure requeue instead.
//!
//! Delays grow along the Fibonacci sequence in whole minutes and are capped:
//! with `new(1, 10)` the delays are 1m, 1m, 2m, 3m, 5m, 8m, 10m, 10m, ...
//!
//! One instance is kept per resource key in the reconciler context. The error policy takes
//! the next delay from it; a successful reconciliation resets it.
//!
//! ## Usage
//!
//! ```rust
//! use astrolabe_operator::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(1, 10);
//! assert_eq!(backoff.next_delay(), Duration::from_secs(60));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(60));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(120));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Fibonacci backoff state for one resource.
///
/// Each delay is the sum of the two before it, starting from `min_minutes` twice, and
/// never exceeds `max_minutes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    /// First delay, and the delay again after [`reset`](Self::reset)
    min_minutes: u64,
    /// Cap on every delay
    max_minutes: u64,
    prev_minutes: u64,
    /// Delay the next call to [`next_delay`](Self::next_delay) hands out
    current_minutes: u64,
    attempts: u32,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_minutes` and capped at `max_minutes`.
    ///
    /// # Arguments
    ///
    /// * `min_minutes` - first delay; `0` is raised to one minute so a retry never spins
    /// * `max_minutes` - cap; a value below the minimum is raised to the minimum
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        let min_minutes = min_minutes.max(1);
        Self {
            min_minutes,
            max_minutes: max_minutes.max(min_minutes),
            prev_minutes: 0,
            current_minutes: min_minutes,
            attempts: 0,
        }
    }

    /// Next delay; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_minutes * 60);
        let next = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next.min(self.max_minutes);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the first delay, as after [`new`](Self::new)
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
        self.attempts = 0;
    }
}
