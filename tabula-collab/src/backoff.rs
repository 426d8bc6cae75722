//! Reconnect policy: capped exponential backoff.
//!
//! `delay(n) = min(initial_delay * 2^n, max_delay)`. With the defaults the
//! sequence for attempts 0..7 is 500, 1000, 2000, 4000, 8000, 8000, 8000,
//! 8000 ms.

use std::time::Duration;

/// Configuration for a [`Connector`](crate::connector::Connector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Retries allowed after consecutive failures before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Outbound frames buffered while not open, flushed on the next open.
    /// `0` drops them instead.
    pub offline_queue_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
            offline_queue_capacity: 0,
        }
    }
}

impl ConnectorConfig {
    /// Defaults: 8 attempts, 500 ms initial delay, 8 s cap, no queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many retries follow consecutive failures.
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Buffer up to `capacity` outbound frames while disconnected.
    #[must_use]
    pub fn with_offline_queue(mut self, capacity: usize) -> Self {
        self.offline_queue_capacity = capacity;
        self
    }

    /// Backoff calculator for these settings.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_attempts,
        }
    }
}

/// Stateless backoff calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Backoff {
    /// Delay to wait before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Retries allowed before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
