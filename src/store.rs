//! # Bulk Store Capability
//!
//! The store is an external collaborator. This crate only needs five things
//! from it, expressed as two traits:
//!
//! ```text
//! BulkStore::begin ──► BulkTransaction
//!                        ├─ prepare(destination, columns)
//!                        ├─ stream_row(row)   × N
//!                        ├─ finalize()
//!                        └─ commit() | rollback()
//! ```
//!
//! All methods are blocking. The flush engine calls them from tokio's blocking
//! pool, one transaction per chunk, several chunks at a time.
//!
//! Connection pooling, retries at the connection level, and the wire protocol
//! belong to the implementation. [`SqliteStore`](crate::sqlite::SqliteStore) is
//! the implementation shipped with the crate.

use crate::error::StoreError;
use crate::types::Row;

/// A store that can open bulk-load transactions.
///
/// Implementations must be shareable across threads: the flush engine holds
/// one `Arc<dyn BulkStore>` and calls [`begin`](BulkStore::begin) concurrently
/// from every worker.
pub trait BulkStore: Send + Sync + 'static {
    /// Starts a new transaction.
    fn begin(&self) -> Result<Box<dyn BulkTransaction>, StoreError>;
}

/// One open transaction with at most one prepared bulk statement.
///
/// A transaction that is dropped without `commit` or `rollback` must be rolled
/// back by the implementation.
pub trait BulkTransaction: Send {
    /// Prepares the bulk statement for `destination` with the given columns.
    fn prepare(&mut self, destination: &str, columns: &[String]) -> Result<(), StoreError>;

    /// Streams one row through the prepared statement.
    fn stream_row(&mut self, row: &Row) -> Result<(), StoreError>;

    /// Completes the bulk statement after the last row.
    fn finalize(&mut self) -> Result<(), StoreError>;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Rolls the transaction back.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

impl<S: BulkStore + ?Sized> BulkStore for std::sync::Arc<S> {
    fn begin(&self) -> Result<Box<dyn BulkTransaction>, StoreError> {
        (**self).begin()
    }
}
