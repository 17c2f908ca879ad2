//! Reconnect delay policy with randomized exponential growth.

use std::time::Duration;

use rand::Rng;

/// Produces growing delays between connection attempts.
///
/// `next_delay` hands out the current delay and then grows it by a random
/// amount in `[0, 2 * current]`, clamped to the ceiling. The sequence is
/// therefore non-decreasing and never exceeds `max`. `reset` snaps back to
/// the floor, so the first delay after a reset is exactly `min`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        debug_assert!(min <= max);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let factor = rand::rng().random_range(0.0..=2.0);
        let grown = self.current.saturating_add(self.current.mul_f64(factor));
        self.current = grown.min(self.max);

        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
