use std::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// The retry policy used to space out attempts against the discovery server.
pub struct RetryPolicy {
    /// How many retries may follow the first attempt.
    max_attempts: u32,
    /// The backoff interval for the first retry. Later retries wait a multiple of it.
    base_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            base_interval,
        }
    }

    /// A policy that never retries: exactly one attempt is made.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            base_interval: time::Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_interval(&self) -> time::Duration {
        self.base_interval
    }

    /// Whether another attempt may follow the zero-based `attempt` that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the time to wait after the zero-based `attempt` failed.
    /// The delay grows linearly: `base_interval * (attempt + 1)`.
    pub fn next_delay(&self, attempt: u32) -> time::Duration {
        self.base_interval.saturating_mul(attempt.saturating_add(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_interval: time::Duration::from_secs(1),
        }
    }
}
