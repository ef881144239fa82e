//! # Live Buffers
//!
//! [`BufferStore`] holds one live buffer per destination. It is owned by the
//! control loop and never shared, so it needs no locks.
//!
//! ## Swap Semantics
//!
//! A swap replaces the live `Vec<Row>` with an empty one (`mem::take`) and
//! returns the old vector inside a [`Batch`]. After the swap the batch and the
//! new buffer share nothing, so the flush engine can own the batch outright
//! while the loop keeps appending.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{Batch, Destination, FlushTrigger, Row};

// =============================================================================
// BufferedDestination
// =============================================================================

/// One destination's live buffer and its flush bookkeeping.
#[derive(Debug)]
pub(crate) struct BufferedDestination {
    destination: Arc<Destination>,
    rows: Vec<Row>,
    last_flush: Instant,
}

impl BufferedDestination {
    fn new(destination: Arc<Destination>, now: Instant) -> Self {
        let rows = Vec::with_capacity(destination.capacity());
        Self {
            destination,
            rows,
            last_flush: now,
        }
    }

    pub(crate) fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row. Returns true once the buffer has reached its capacity.
    pub(crate) fn push(&mut self, row: Row) -> bool {
        self.rows.push(row);
        self.is_full()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.rows.len() >= self.destination.capacity()
    }

    /// True if the timer should flush this buffer: it holds rows and is either
    /// older than `max_age` or already at capacity.
    pub(crate) fn is_due(&self, now: Instant, max_age: Duration) -> bool {
        !self.is_empty()
            && (now.saturating_duration_since(self.last_flush) > max_age || self.is_full())
    }

    /// Detaches the current rows and starts a fresh buffer.
    ///
    /// Returns `None` if there was nothing to flush. The last-flush timestamp is
    /// reset either way.
    pub(crate) fn swap(&mut self, trigger: FlushTrigger, now: Instant) -> Option<Batch> {
        self.last_flush = now;
        if self.rows.is_empty() {
            return None;
        }

        let rows = mem::replace(
            &mut self.rows,
            Vec::with_capacity(self.destination.capacity()),
        );

        Some(Batch {
            destination: Arc::clone(&self.destination),
            rows,
            trigger,
        })
    }
}

// =============================================================================
// BufferStore
// =============================================================================

/// All live buffers, keyed by destination name, iterated in config order.
#[derive(Debug)]
pub(crate) struct BufferStore {
    buffers: Vec<BufferedDestination>,
    index: HashMap<String, usize>,
}

impl BufferStore {
    pub(crate) fn new(destinations: &[Arc<Destination>], now: Instant) -> Self {
        let buffers: Vec<_> = destinations
            .iter()
            .map(|d| BufferedDestination::new(Arc::clone(d), now))
            .collect();
        let index = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| (b.destination.name().to_string(), i))
            .collect();

        Self { buffers, index }
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut BufferedDestination> {
        let i = *self.index.get(name)?;
        self.buffers.get_mut(i)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BufferedDestination> {
        self.buffers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferedDestination> {
        self.buffers.iter_mut()
    }

    /// Current row count per destination.
    pub(crate) fn lengths(&self) -> HashMap<String, usize> {
        self.buffers
            .iter()
            .map(|b| (b.destination.name().to_string(), b.len()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
