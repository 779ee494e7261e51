//! Scheduler Statistics
//!
//! Lock-free per-backend counters, read as [`SchedulerStats`] snapshots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::request::QueryStatus;

/// Point-in-time counters of one backend
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Backend name
    pub backend: String,
    /// Connections in the backend's pool
    pub pool_size: usize,
    /// Connections currently idle
    pub idle_connections: usize,
    /// Requests accepted into the queue
    pub submitted: u64,
    /// Requests rejected before reaching the queue
    pub rejected: u64,
    /// Requests bound to a connection
    pub dispatched: u64,
    /// Requests resolved as successful
    pub succeeded: u64,
    /// Requests resolved as errors (including `false` verdicts)
    pub failed: u64,
    /// Running requests cancelled by the caller
    pub cancelled: u64,
    /// Requests that ran out of time
    pub deadline_exceeded: u64,
    /// Responses discarded because their request was no longer running
    pub dropped_late: u64,
    /// Requests running right now
    pub running: usize,
    /// Highest number of simultaneously running requests
    pub peak_running: usize,
    /// Requests waiting right now
    pub queue_depth: usize,
    /// Highest queue depth
    pub peak_queue_depth: usize,
}

/// Atomic statistics for lock-free updates
#[derive(Debug, Default)]
pub(crate) struct BackendStatsAtomic {
    submitted: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    deadline_exceeded: AtomicU64,
    dropped_late: AtomicU64,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl BackendStatsAtomic {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn record_dropped_late(&self) {
        self.dropped_late.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatched request left its connection
    pub(crate) fn record_finished(&self, status: Option<QueryStatus>, deadline_exceeded: bool) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        let counter = match status {
            Some(QueryStatus::Successful) => &self.succeeded,
            Some(QueryStatus::Error | QueryStatus::SyntaxError) => &self.failed,
            Some(QueryStatus::Unknown) => &self.cancelled,
            None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if deadline_exceeded {
            self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, backend: &str) -> SchedulerStats {
        SchedulerStats {
            backend: backend.to_string(),
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            dropped_late: self.dropped_late.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
            peak_running: self.peak_running.load(Ordering::SeqCst),
            ..SchedulerStats::default()
        }
    }
}
