use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// How the admission step ended for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Throttled,
    /// Denied because identity or storage made a decision impossible
    Rejected,
}

/// Snapshot served by `/metrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GovernanceMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub throttled_requests: u64,
    pub rejected_requests: u64,
    pub usage_dropped: u64,
}

/// Process-wide admission counters. Fixed size regardless of how many
/// clients are seen.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total: AtomicU64,
    admitted: AtomicU64,
    throttled: AtomicU64,
    rejected: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, decision: Decision) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            Decision::Admitted => &self.admitted,
            Decision::Throttled => &self.throttled,
            Decision::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, usage_dropped: u64) -> GovernanceMetrics {
        GovernanceMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            admitted_requests: self.admitted.load(Ordering::Relaxed),
            throttled_requests: self.throttled.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            usage_dropped,
        }
    }
}
