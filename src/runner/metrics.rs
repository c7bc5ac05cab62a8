use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide validation counters.
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    validations_total: AtomicU64,
    validations_succeeded: AtomicU64,
    validations_failed: AtomicU64,
    llm_fix_attempts: AtomicU64,
    llm_fix_successes: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub validations_total: u64,
    pub validations_succeeded: u64,
    pub validations_failed: u64,
    pub llm_fix_attempts: u64,
    pub llm_fix_successes: u64,
    /// Percentage of finished validations that succeeded.
    pub success_rate: f64,
}

impl RunnerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.validations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.validations_succeeded
        } else {
            &self.validations_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fix_attempt(&self, succeeded: bool) {
        self.llm_fix_attempts.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.llm_fix_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.validations_succeeded.load(Ordering::Relaxed);
        let failed = self.validations_failed.load(Ordering::Relaxed);
        let finished = succeeded + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            (succeeded as f64 / finished as f64) * 100.0
        };
        MetricsSnapshot {
            validations_total: self.validations_total.load(Ordering::Relaxed),
            validations_succeeded: succeeded,
            validations_failed: failed,
            llm_fix_attempts: self.llm_fix_attempts.load(Ordering::Relaxed),
            llm_fix_successes: self.llm_fix_successes.load(Ordering::Relaxed),
            success_rate,
        }
    }
}
