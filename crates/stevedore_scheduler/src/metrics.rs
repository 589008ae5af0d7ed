//! Scheduler metrics.
//!
//! Plain atomics, single global instance, Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub jobs_submitted: AtomicU64,
    pub jobs_rejected: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_canceled: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_swept: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_canceled: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_swept: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_canceled(&self) {
        self.jobs_canceled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_swept(&self, count: u64) {
        self.jobs_swept.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_swept: self.jobs_swept.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format.
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP stevedore_jobs_submitted_total Jobs admitted to the queue
# TYPE stevedore_jobs_submitted_total counter
stevedore_jobs_submitted_total {}

# HELP stevedore_jobs_rejected_total Jobs rejected at admission (queue full)
# TYPE stevedore_jobs_rejected_total counter
stevedore_jobs_rejected_total {}

# HELP stevedore_jobs_succeeded_total Jobs that finished successfully
# TYPE stevedore_jobs_succeeded_total counter
stevedore_jobs_succeeded_total {}

# HELP stevedore_jobs_failed_total Jobs that finished in failure
# TYPE stevedore_jobs_failed_total counter
stevedore_jobs_failed_total {}

# HELP stevedore_jobs_canceled_total Jobs canceled by users or shutdown
# TYPE stevedore_jobs_canceled_total counter
stevedore_jobs_canceled_total {}

# HELP stevedore_jobs_retried_total Retry episodes started after a retryable failure
# TYPE stevedore_jobs_retried_total counter
stevedore_jobs_retried_total {}

# HELP stevedore_jobs_swept_total Jobs removed by the retention sweeper
# TYPE stevedore_jobs_swept_total counter
stevedore_jobs_swept_total {}
"#,
            s.jobs_submitted,
            s.jobs_rejected,
            s.jobs_succeeded,
            s.jobs_failed,
            s.jobs_canceled,
            s.jobs_retried,
            s.jobs_swept,
        )
    }
}

/// Immutable snapshot for reading.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_canceled: u64,
    pub jobs_retried: u64,
    pub jobs_swept: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let metrics = Metrics::new();
        metrics.inc_submitted();
        metrics.inc_submitted();
        metrics.inc_retried();
        let s = metrics.snapshot();
        assert_eq!(s.jobs_submitted, 2);
        assert_eq!(s.jobs_retried, 1);
    }

    #[test]
    fn prometheus_format_renders_counters() {
        let metrics = Metrics::new();
        metrics.inc_succeeded();
        let out = metrics.prometheus_format();
        assert!(out.contains("stevedore_jobs_succeeded_total 1"));
    }
}
