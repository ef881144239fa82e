//! # Domain Types for tablebuffer
//!
//! This module defines the values that flow from `write` to the store:
//! cells ([`Value`]), rows ([`Row`]), resolved destinations ([`Destination`]),
//! and the snapshots handed to the flush engine ([`Batch`], [`Chunk`]).
//!
//! ## Ownership
//!
//! ```text
//!   write(row) ──► live buffer (Vec<Row>, owned by control loop)
//!                        │ swap (mem::take)
//!                        ▼
//!                  Batch (Vec<Row>, owned by flush engine)
//!                        │ shard (moves rows, never copies)
//!                        ▼
//!              Chunk 0   Chunk 1  ...  Chunk W-1  (one per bulk writer)
//! ```
//!
//! Rows are moved at every step, never cloned, so a row can only ever be visible
//! in one place: the live buffer, or exactly one chunk.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

// =============================================================================
// Values
// =============================================================================

/// A single typed cell in a row.
///
/// Arity and type compatibility with the destination's columns are not checked
/// when a row is buffered. The store is the authority and rejects bad rows at
/// flush time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// =============================================================================
// Rows
// =============================================================================

/// An ordered sequence of values, one per destination column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(Vec<Value>);

impl Row {
    /// Creates a row from its values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Builds a [`Row`] from a list of expressions convertible into [`Value`].
///
/// ```rust
/// use tablebuffer::{row, Value};
///
/// let r = row![1_i64, "login", None::<i64>];
/// assert_eq!(r.values()[2], Value::Null);
/// ```
#[macro_export]
macro_rules! row {
    () => {
        $crate::Row::default()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Row::new(vec![$($crate::Value::from($value)),+])
    };
}

// =============================================================================
// Destinations
// =============================================================================

/// A resolved destination definition.
///
/// Built once from [`DestinationConfig`](crate::config::DestinationConfig) with
/// defaults applied, then shared by `Arc` between the live buffer and every
/// batch taken from it. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    name: String,
    columns: Vec<String>,
    capacity: usize,
}

impl Destination {
    /// Creates a destination. `capacity` must already be positive.
    pub(crate) fn new(name: String, columns: Vec<String>, capacity: usize) -> Self {
        debug_assert!(capacity > 0, "destination capacity must be positive");
        Self {
            name,
            columns,
            capacity,
        }
    }

    /// Destination name (usually a table name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered column list used by the bulk statement.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row count at which the buffer is swapped out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Batches and Chunks
// =============================================================================

/// Why a buffer was swapped out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached its capacity.
    Capacity,
    /// The buffer is older than the configured max age.
    MaxAge,
    /// An explicit flush-all signal.
    Signal,
    /// The final flush on stop.
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Capacity => "capacity",
            FlushTrigger::MaxAge => "max_age",
            FlushTrigger::Signal => "signal",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// An immutable snapshot of one destination's rows at the moment of swap.
///
/// Owned by the flush engine for its whole lifetime. It has no path back to the
/// live buffer it came from.
#[derive(Debug)]
pub struct Batch {
    /// Destination the rows belong to
    pub destination: Arc<Destination>,
    /// Rows in arrival order
    pub rows: Vec<Row>,
    /// What caused the swap
    pub trigger: FlushTrigger,
}

impl Batch {
    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A contiguous slice of a batch assigned to one bulk writer.
#[derive(Debug)]
pub struct Chunk {
    /// Chunk number within its batch, starting at 0
    pub index: usize,
    /// Position of the chunk's first row within its batch
    pub offset: usize,
    /// Rows in batch order
    pub rows: Vec<Row>,
}

// =============================================================================
// Tests
// =============================================================================
