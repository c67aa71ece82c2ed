//! # Fibonacci Backoff
//!
//! Progressive backoff for retries: initialization attempts and watch
//! reconnects. Grows more slowly than doubling while still spacing
//! attempts out meaningfully.
//!
//! With min 30 and max 300 the sequence is: 30s, 30s, 60s, 90s, 150s,
//! 240s, 300s (capped).

use std::time::Duration;

/// Fibonacci backoff calculator.
///
/// Each delay is the sum of the previous two, capped at `max_secs`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Creates a backoff starting at `min_secs` and capped at `max_secs`.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);

        let next_secs = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = next_secs.min(self.max_secs);

        result
    }

    /// Resets the sequence after a success.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
