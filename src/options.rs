use std::time::Duration;

/// Bounded exponential backoff for metadata fetches.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied to the delay after every retry.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay after `delay`: multiplied, then clamped to `max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.as_nanos() as f64 * self.multiplier;
        if !grown.is_finite() || grown >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(grown.max(0.0) as u64)
    }

    /// Delay slept before attempt `attempt` (zero-based). Attempt 0 has no delay.
    ///
    /// Equals `min(base_delay * multiplier^(attempt - 1), max_delay)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let mut delay = self.base_delay.min(self.max_delay);
        for _ in 1..attempt {
            delay = self.next_delay(delay);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Configures HTTP timeout and retry behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt transport timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}
