//! # Flush Engine
//!
//! Takes one swapped-out [`Batch`], shards it into chunks, writes every chunk
//! in parallel, and waits for all of them.
//!
//! ## Sharding
//!
//! For a batch of `S` rows and `W` workers:
//!
//! ```text
//! S <= W:  one chunk with all S rows
//! S >  W:  W contiguous chunks; the first S % W chunks get one extra row
//!
//! S = 10, W = 3:   [0 1 2 3] [4 5 6] [7 8 9]
//! ```
//!
//! Rows are moved into chunks, never copied, so the chunks partition the batch
//! exactly.
//!
//! ## Join Barrier
//!
//! Each chunk runs on tokio's blocking pool (store calls are synchronous). The
//! chunk tasks live in a `JoinSet` scoped to a single [`FlushEngine::flush`]
//! call, so no task outlives the flush that spawned it. A failed or panicked
//! chunk is logged and counted; its siblings keep going.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{dispatcher, Dispatch};

use crate::config::RowFailurePolicy;
use crate::metrics::BufferMetrics;
use crate::store::BulkStore;
use crate::types::{Batch, Chunk, FlushTrigger};
use crate::writer::{BulkWriter, ChunkOutcome};

// =============================================================================
// Sharding
// =============================================================================

/// Splits `items` into at most `workers` contiguous, non-empty-when-possible
/// chunks, preserving order.
///
/// If `items.len() <= workers` the whole input is returned as one chunk.
/// Otherwise exactly `workers` chunks are returned, the first
/// `items.len() % workers` of them one element longer than the rest.
pub(crate) fn shard<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let total = items.len();
    if total <= workers || workers <= 1 {
        return vec![items];
    }

    let base = total / workers;
    let remainder = total % workers;

    let mut iter = items.into_iter();
    (0..workers)
        .map(|i| {
            let size = base + usize::from(i < remainder);
            iter.by_ref().take(size).collect()
        })
        .collect()
}

// =============================================================================
// Flush Report
// =============================================================================

/// Summary of one flush, logged when the flush finishes.
#[derive(Debug, Clone)]
pub(crate) struct FlushReport {
    /// Destination that was flushed
    pub(crate) destination: String,
    /// What caused the flush
    pub(crate) trigger: FlushTrigger,
    /// Rows in the batch
    pub(crate) rows: usize,
    /// Chunks the batch was split into
    pub(crate) chunks: usize,
    /// Rows durably committed
    pub(crate) committed: usize,
    /// Rows dropped individually under the skip-row policy
    pub(crate) skipped: usize,
    /// Chunks that did not commit
    pub(crate) failed_chunks: usize,
    /// Wall time from dispatch to the last chunk finishing
    pub(crate) elapsed: Duration,
}

impl FlushReport {
    /// Rows that were neither committed nor skipped.
    pub(crate) fn lost(&self) -> usize {
        self.rows - self.committed - self.skipped
    }
}

// =============================================================================
// Flush Engine
// =============================================================================

/// Shards batches and drives the bulk writers.
#[derive(Clone)]
pub(crate) struct FlushEngine {
    store: Arc<dyn BulkStore>,
    workers: usize,
    policy: RowFailurePolicy,
    metrics: Arc<BufferMetrics>,
    dispatch: Dispatch,
}

impl FlushEngine {
    pub(crate) fn new(
        store: Arc<dyn BulkStore>,
        workers: usize,
        policy: RowFailurePolicy,
        metrics: Arc<BufferMetrics>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            store,
            workers,
            policy,
            metrics,
            dispatch,
        }
    }

    /// The logging sink chunk workers run under.
    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Flushes one batch and waits for every chunk to finish.
    pub(crate) async fn flush(self, batch: Batch) -> FlushReport {
        let started = Instant::now();
        let Batch {
            destination,
            rows,
            trigger,
        } = batch;
        let total = rows.len();

        self.metrics.record_flush();

        let writer = BulkWriter::new(Arc::clone(&self.store), Arc::clone(&destination), self.policy);
        let mut tasks = JoinSet::new();
        let mut offset = 0;
        let mut chunk_count = 0;

        for (index, rows) in shard(rows, self.workers).into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let chunk = Chunk {
                index,
                offset,
                rows,
            };
            offset += chunk.rows.len();
            chunk_count += 1;

            tracing::debug!(
                destination = %destination.name(),
                chunk = index,
                rows = chunk.rows.len(),
                "dispatching chunk"
            );

            let writer = writer.clone();
            let dispatch = self.dispatch.clone();
            tasks.spawn_blocking(move || {
                dispatcher::with_default(&dispatch, || writer.write_chunk(chunk))
            });
        }

        let mut report = FlushReport {
            destination: destination.name().to_string(),
            trigger,
            rows: total,
            chunks: chunk_count,
            committed: 0,
            skipped: 0,
            failed_chunks: 0,
            elapsed: Duration::ZERO,
        };

        let mut accounted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    accounted += outcome.rows;
                    self.record(&mut report, outcome);
                }
                Err(e) => {
                    tracing::error!(
                        destination = %destination.name(),
                        error = %e,
                        "chunk writer panicked"
                    );
                    self.metrics.record_chunk_failed(0);
                    report.failed_chunks += 1;
                }
            }
        }

        // A panicked chunk never reports its size; its rows are whatever the
        // finished chunks did not account for.
        if accounted < total {
            self.metrics.record_rows_lost((total - accounted) as u64);
        }

        report.elapsed = started.elapsed();

        tracing::info!(
            destination = %report.destination,
            trigger = %report.trigger,
            rows = report.rows,
            chunks = report.chunks,
            committed = report.committed,
            skipped = report.skipped,
            failed_chunks = report.failed_chunks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "flushed batch"
        );

        report
    }

    fn record(&self, report: &mut FlushReport, outcome: ChunkOutcome) {
        if outcome.is_committed() {
            self.metrics
                .record_chunk_committed(outcome.committed as u64, outcome.skipped as u64);
            report.committed += outcome.committed;
            report.skipped += outcome.skipped;
        } else {
            tracing::debug!(
                destination = %report.destination,
                chunk = outcome.index,
                rows = outcome.rows,
                "chunk rows lost"
            );
            self.metrics.record_chunk_failed(outcome.rows as u64);
            report.failed_chunks += 1;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
