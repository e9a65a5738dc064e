//! Reconnect policy
//!
//! Exponential delays capped at a maximum, with a bounded attempt count.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Reconnect delay generator
pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    /// `max_attempts == 0` retries forever
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial_delay)
            .with_max_interval(max_delay)
            .with_multiplier(multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        Self {
            backoff,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or None once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        self.backoff.next_backoff()
    }

    /// Connection succeeded; start over
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
