//! # tablebuffer - Buffered Bulk Loading
//!
//! tablebuffer sits between producers of tabular rows and a relational store.
//! It provides:
//!
//! - **Per-destination buffering**: rows accumulate in memory per table
//! - **Size and age triggers**: a buffer is flushed when it fills up or gets old
//! - **Parallel bulk writes**: each flush is sharded across W concurrent writers
//! - **Explicit backpressure**: producers wait, fail fast, or block a thread
//! - **Orderly shutdown**: a final flush that waits for every in-flight commit
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Producers (BufferHandle clones)                │
//! │              (write, try_write, blocking_write)                 │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ bounded mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Control Loop                             │
//! │             (single task, owns every live buffer)               │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Capacity   │  │   Ticker    │  │  Flush-all / Stop       │ │
//! │  │  trigger    │  │  (max age)  │  │  signals                │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ swapped batch
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Flush Engine                             │
//! │         (shard into W chunks, one bulk writer per chunk)        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ one transaction per chunk
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    BulkStore (e.g. SQLite)                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single owner**: only the control loop touches a live buffer
//! 2. **No duplication**: a swapped batch shares nothing with the new buffer
//! 3. **Partitioning**: a batch's chunks cover every row exactly once, in order
//! 4. **Chunk isolation**: one chunk's failure never rolls back another
//! 5. **Non-blocking writers**: writers never wait on a flush, only on the channel
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for every failure mode
//! - [`types`]: Rows, values, destinations, batches
//! - [`config`]: Serde-friendly configuration and defaults
//! - [`store`]: The bulk-store capability traits
//! - [`sqlite`]: SQLite implementation of the store traits
//! - [`metrics`]: Counters exposed through handles
//! - [`api`]: [`TableBuffer`] and [`BufferHandle`] (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for tablebuffer operations.
///
/// A single error enum covers config, flush-time and handle errors.
pub mod error;

/// Domain types: [`Value`], [`Row`], [`Destination`](types::Destination) and the
/// batch/chunk snapshots handed to the flush engine.
pub mod types;

/// Buffer configuration.
///
/// Everything deserializes with serde; durations use humantime strings
/// (`"500ms"`, `"5s"`).
pub mod config;

/// The store capability traits.
pub mod store;

/// SQLite bulk store.
pub mod sqlite;

/// Buffer metrics.
pub mod metrics;

/// Async API for tablebuffer.
///
/// The main entry point is [`TableBuffer`](api::TableBuffer).
pub mod api;

mod buffer;
mod control;
mod flush;
mod validate;
mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{BufferHandle, TableBuffer};
pub use config::{BufferConfig, DestinationConfig, RowFailurePolicy};
pub use error::{Error, Result, StoreError};
pub use metrics::MetricsSnapshot;
pub use sqlite::SqliteStore;
pub use store::{BulkStore, BulkTransaction};
pub use types::{FlushTrigger, Row, Value};
