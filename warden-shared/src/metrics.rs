use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::debug;

/// Lock metrics collector, one per primitive instance
#[derive(Debug, Clone)]
pub struct LockMetrics {
    metrics_prefix: String,
}

impl LockMetrics {
    /// `component` names the primitive, e.g. `distributed`, `redlock`, `semaphore`
    pub fn new(component: &str) -> Self {
        let metrics_prefix = format!("warden.lock.{component}");
        debug!("Lock metrics initialized with prefix: {}", metrics_prefix);
        Self { metrics_prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.metrics_prefix
    }

    /// Record a successful acquisition and how long it took
    pub fn record_acquired(&self, wait: Duration) {
        counter!(format!("{}.acquired.total", self.metrics_prefix)).increment(1);
        gauge!(format!("{}.held", self.metrics_prefix)).increment(1.0);
        histogram!(format!("{}.wait.seconds", self.metrics_prefix)).record(wait.as_secs_f64());
    }

    /// Record an acquisition that gave up
    pub fn record_failed(&self) {
        counter!(format!("{}.failed.total", self.metrics_prefix)).increment(1);
    }

    pub fn record_released(&self) {
        counter!(format!("{}.released.total", self.metrics_prefix)).increment(1);
        gauge!(format!("{}.held", self.metrics_prefix)).decrement(1.0);
    }

    /// Record a single contended attempt (busy key, version conflict, deadlock)
    pub fn record_contention(&self) {
        counter!(format!("{}.contention.total", self.metrics_prefix)).increment(1);
    }

    pub fn record_retry(&self, delay: Duration) {
        counter!(format!("{}.retries.total", self.metrics_prefix)).increment(1);
        histogram!(format!("{}.retry_delay.seconds", self.metrics_prefix))
            .record(delay.as_secs_f64());
    }
}
