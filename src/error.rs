//! # Error Handling for tablebuffer
//!
//! This module defines the error types used throughout the crate. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple for library users.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` comes from `#[from]` attributes
//! - Source chaining comes from `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Variants | Surfaced to |
//! |----------|----------|-------------|
//! | Config | `Config`, `Probe` | Caller of `TableBuffer::start` (fatal) |
//! | Flush-time | `Connection`, `Statement`, `Row`, `Commit` | Logs and metrics only |
//! | Handle | `UnknownDestination`, `Saturated`, `Stopped` | Caller of `write` |
//! | Adapter | `Sqlite` | Caller of `SqliteStore::open` |
//!
//! Flush-time errors never reach the caller of `write`: they are contained to the
//! chunk that produced them.

use thiserror::Error;

/// Error type returned by [`BulkStore`](crate::store::BulkStore) and
/// [`BulkTransaction`](crate::store::BulkTransaction) implementations.
///
/// The store is an external collaborator, so its errors are opaque to us. The
/// bulk writer wraps them into the variant matching the phase that failed.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in tablebuffer operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Config Errors (fatal at construction)
    // =========================================================================

    /// The configuration is unusable before any store round-trip is attempted.
    ///
    /// # When This Happens
    ///
    /// - No destinations were configured
    /// - A destination has an empty name or an empty column list
    /// - Two destinations share a name
    #[error("config error: {0}")]
    Config(String),

    /// A destination's bulk statement could not be probed against the store.
    ///
    /// The probe opens a transaction, prepares the bulk statement and rolls back.
    /// `source` is the [`Error::Connection`] or [`Error::Statement`] that stopped it.
    #[error("config error: destination '{destination}' failed validation: {source}")]
    Probe {
        /// The destination whose probe failed
        destination: String,
        /// What went wrong during the probe
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Flush-Time Errors (contained to one chunk)
    // =========================================================================

    /// A transaction could not be started. The chunk is abandoned, no rows written.
    #[error("connection error: {0}")]
    Connection(#[source] StoreError),

    /// The bulk statement could not be prepared. The transaction is rolled back.
    #[error("statement error on '{destination}': {source}")]
    Statement {
        /// Destination the statement was prepared for
        destination: String,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// One row was rejected while streaming.
    ///
    /// Whether this aborts the chunk depends on the configured
    /// [`RowFailurePolicy`](crate::config::RowFailurePolicy).
    #[error("row {index} rejected by '{destination}': {source}")]
    Row {
        /// Destination the row was streamed to
        destination: String,
        /// Position of the row inside its batch
        index: usize,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// Finalizing or committing failed. The chunk's rows are not durable.
    #[error("commit error on '{destination}': {source}")]
    Commit {
        /// Destination the chunk was written to
        destination: String,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    // =========================================================================
    // Handle Errors (returned to writers)
    // =========================================================================

    /// The destination is not part of the configuration.
    #[error("unknown destination '{0}'")]
    UnknownDestination(String),

    /// The event channel is full and the caller asked not to wait.
    #[error("buffer is saturated: event channel is full")]
    Saturated,

    /// The control loop has terminated and accepts no further events.
    #[error("buffer has stopped")]
    Stopped,

    // =========================================================================
    // Adapter Errors
    // =========================================================================

    /// SQLite operation failed while setting up the SQLite store.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Returns true for errors that belong to the config category.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Probe { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
