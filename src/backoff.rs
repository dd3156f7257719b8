//! Escalating delay applied after rate-limited transfers.

use std::time::Duration;

/// First delay after a rate-limited transfer.
pub const INITIAL_RATE_LIMIT_DELAY: Duration = Duration::from_secs(300);

/// Doubling backoff for rate-limit events.
///
/// The delay doubles on every event and never resets for the life of the
/// value; the engine keeps one instance per process.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    next: Duration,
    events: u32,
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self::new(INITIAL_RATE_LIMIT_DELAY)
    }
}

impl RateLimitBackoff {
    pub fn new(initial: Duration) -> Self {
        Self {
            next: initial,
            events: 0,
        }
    }

    /// Delay to wait for the current event; advances to the next step.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        self.events += 1;
        delay
    }

    /// Number of rate-limit events seen so far.
    pub fn events(&self) -> u32 {
        self.events
    }
}
