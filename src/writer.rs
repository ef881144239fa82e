//! # Bulk Writer
//!
//! Writes one [`Chunk`] to the store as a single transaction:
//!
//! ```text
//! begin ──► prepare ──► stream_row × N ──► finalize ──► commit
//!   │          │              │                │           │
//!   ▼          ▼              ▼                ▼           ▼
//! abandon   rollback     policy: abort     rollback    (store rolls
//! (nothing  + abandon    (rollback) or     + abandon    back itself)
//!  to undo)              skip the row
//! ```
//!
//! Every failure is logged here and returned in the [`ChunkOutcome`]. Nothing
//! propagates further: a failed chunk never affects its siblings, the control
//! loop, or writers.
//!
//! ## Invariants
//!
//! - Rows are streamed in batch order
//! - A chunk is committed entirely or not at all (minus rows skipped under
//!   [`RowFailurePolicy::SkipRow`])
//! - Each chunk has its own transaction; there is no visibility across chunks

use std::sync::Arc;

use crate::config::RowFailurePolicy;
use crate::error::Error;
use crate::store::{BulkStore, BulkTransaction};
use crate::types::{Chunk, Destination};

// =============================================================================
// Chunk Outcome
// =============================================================================

/// What happened to one chunk.
#[derive(Debug)]
pub(crate) struct ChunkOutcome {
    /// Chunk number within its batch
    pub(crate) index: usize,
    /// Rows the chunk held
    pub(crate) rows: usize,
    /// Rows durably committed
    pub(crate) committed: usize,
    /// Rows dropped under the skip-row policy
    pub(crate) skipped: usize,
    /// Why the chunk was abandoned, if it was
    pub(crate) error: Option<Error>,
}

impl ChunkOutcome {
    /// Returns true if the chunk's transaction committed.
    pub(crate) fn is_committed(&self) -> bool {
        self.error.is_none()
    }
}

// =============================================================================
// Bulk Writer
// =============================================================================

/// Loads chunks for one destination.
///
/// Cheap to clone: the flush engine hands one clone to each worker.
#[derive(Clone)]
pub(crate) struct BulkWriter {
    store: Arc<dyn BulkStore>,
    destination: Arc<Destination>,
    policy: RowFailurePolicy,
}

impl BulkWriter {
    pub(crate) fn new(
        store: Arc<dyn BulkStore>,
        destination: Arc<Destination>,
        policy: RowFailurePolicy,
    ) -> Self {
        Self {
            store,
            destination,
            policy,
        }
    }

    /// Writes one chunk. Blocking: run it on the blocking pool.
    pub(crate) fn write_chunk(&self, chunk: Chunk) -> ChunkOutcome {
        let rows = chunk.rows.len();
        let index = chunk.index;

        match self.load(&chunk) {
            Ok(skipped) => {
                tracing::debug!(
                    destination = %self.destination.name(),
                    chunk = index,
                    rows,
                    skipped,
                    "chunk committed"
                );
                ChunkOutcome {
                    index,
                    rows,
                    committed: rows - skipped,
                    skipped,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    destination = %self.destination.name(),
                    chunk = index,
                    rows,
                    error = %e,
                    "chunk abandoned"
                );
                ChunkOutcome {
                    index,
                    rows,
                    committed: 0,
                    skipped: 0,
                    error: Some(e),
                }
            }
        }
    }

    /// Runs the transaction. Returns the number of skipped rows on commit.
    fn load(&self, chunk: &Chunk) -> Result<usize, Error> {
        let name = self.destination.name();

        let mut tx = self.store.begin().map_err(Error::Connection)?;

        if let Err(source) = tx.prepare(name, self.destination.columns()) {
            self.rollback(tx);
            return Err(Error::Statement {
                destination: name.to_string(),
                source,
            });
        }

        let mut skipped = 0;
        for (i, row) in chunk.rows.iter().enumerate() {
            let Err(source) = tx.stream_row(row) else {
                continue;
            };

            let err = Error::Row {
                destination: name.to_string(),
                index: chunk.offset + i,
                source,
            };

            match self.policy {
                RowFailurePolicy::AbortChunk => {
                    self.rollback(tx);
                    return Err(err);
                }
                RowFailurePolicy::SkipRow => {
                    tracing::warn!(
                        destination = %name,
                        chunk = chunk.index,
                        error = %err,
                        "skipping rejected row"
                    );
                    skipped += 1;
                }
            }
        }

        if let Err(source) = tx.finalize() {
            self.rollback(tx);
            return Err(Error::Commit {
                destination: name.to_string(),
                source,
            });
        }

        tx.commit().map_err(|source| Error::Commit {
            destination: name.to_string(),
            source,
        })?;

        Ok(skipped)
    }

    fn rollback(&self, tx: Box<dyn BulkTransaction>) {
        if let Err(e) = tx.rollback() {
            tracing::warn!(
                destination = %self.destination.name(),
                error = %e,
                "rollback failed"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
