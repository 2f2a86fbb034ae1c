// Backoff applied by daemon loops after consecutive failed iterations

use rand::Rng;
use std::time::Duration;

/// Backoff strategy trait for calculating the pause after a failure
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt after `failures` consecutive failures (1-based)
    fn next_delay(&self, failures: u32) -> Duration;
}

/// Exponential backoff with jitter
/// Sequence: base, base*3, base*9, ... capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Jitter factor (0.0 to 1.0, default: 0.1 = 10%)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(900),
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_factor: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Exponential delay without jitter, in milliseconds
    fn calculate_base_delay_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay = base_ms.saturating_mul(3_u64.saturating_pow(exponent));
        delay.min(self.max_delay.as_millis() as u64)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Duration {
        let base_delay_ms = self.calculate_base_delay_ms(failures);
        Duration::from_millis(self.add_jitter_ms(base_delay_ms))
    }
}

/// Fixed delay strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, _failures: u32) -> Duration {
        self.delay
    }
}
