use crate::misc::RngUtils;
use std::time::Duration;

/// Exponential backoff schedule: `initial * multiplier^attempt`, optionally capped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Option<Duration>,
}

impl Backoff {
    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            multiplier,
            max: None,
        }
    }

    /// Doubling schedule, the default for lock acquisition retries
    pub fn doubling(initial: Duration) -> Self {
        Self::exponential(initial, 2.0)
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Delay for `attempt`, randomized to between `low_fraction` and 100% of its value
    pub fn jittered_delay(&self, attempt: u32, low_fraction: f64) -> Duration {
        Self::jitter(self.delay(attempt), low_fraction)
    }

    pub fn jitter(delay: Duration, low_fraction: f64) -> Duration {
        let secs = delay.as_secs_f64() * RngUtils::random_fraction(low_fraction);
        Duration::try_from_secs_f64(secs).unwrap_or(delay)
    }
}
