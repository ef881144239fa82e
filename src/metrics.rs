//! Buffer metrics
//!
//! Atomic counters shared by the handle, the control loop and the flush
//! workers. Relaxed ordering: the counters are for observation, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one [`TableBuffer`](crate::TableBuffer).
#[derive(Debug, Default)]
pub struct BufferMetrics {
    /// Rows appended to a live buffer
    pub rows_accepted: AtomicU64,

    /// Batches handed to the flush engine
    pub flushes: AtomicU64,

    /// Chunks whose transaction committed
    pub chunks_committed: AtomicU64,

    /// Chunks abandoned or rolled back
    pub chunks_failed: AtomicU64,

    /// Rows durably committed
    pub rows_committed: AtomicU64,

    /// Rows dropped individually under the skip-row policy
    pub rows_skipped: AtomicU64,

    /// Rows lost with a failed chunk
    pub rows_lost: AtomicU64,
}

impl BufferMetrics {
    /// Create new metrics instance
    pub const fn new() -> Self {
        Self {
            rows_accepted: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            chunks_committed: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            rows_committed: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
            rows_lost: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_row_accepted(&self) {
        self.rows_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_chunk_committed(&self, rows: u64, skipped: u64) {
        self.chunks_committed.fetch_add(1, Ordering::Relaxed);
        self.rows_committed.fetch_add(rows, Ordering::Relaxed);
        self.rows_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_chunk_failed(&self, rows: u64) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        self.rows_lost.fetch_add(rows, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rows_lost(&self, rows: u64) {
        self.rows_lost.fetch_add(rows, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_accepted: self.rows_accepted.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            chunks_committed: self.chunks_committed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            rows_committed: self.rows_committed.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            rows_lost: self.rows_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BufferMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Rows appended to a live buffer
    pub rows_accepted: u64,

    /// Batches handed to the flush engine
    pub flushes: u64,

    /// Chunks whose transaction committed
    pub chunks_committed: u64,

    /// Chunks abandoned or rolled back
    pub chunks_failed: u64,

    /// Rows durably committed
    pub rows_committed: u64,

    /// Rows dropped individually under the skip-row policy
    pub rows_skipped: u64,

    /// Rows lost with a failed chunk
    pub rows_lost: u64,
}
