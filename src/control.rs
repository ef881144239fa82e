//! # Control Loop
//!
//! The single task that owns every live buffer. It consumes one bounded
//! channel of [`Command`]s, a periodic ticker, and the completions of its own
//! in-flight flushes:
//!
//! ```text
//!   BufferHandle ──► mpsc (bounded) ──┐
//!                                     ▼
//!   ticker ─────────────────────► select! ──► BufferStore (owned)
//!                                     ▲            │ swap
//!   in-flight flushes (JoinSet) ──────┘            ▼
//!                                            FlushEngine::flush (spawned)
//! ```
//!
//! ## States
//!
//! - **Running**: writes are appended; full buffers, due buffers (on tick) and
//!   flush-all swap and dispatch batches without waiting for them.
//! - **Stopping**: the channel is closed and writes already queued in it are
//!   appended. Every destination is then swapped once more, and the loop waits
//!   for all in-flight flushes, including ones dispatched before the stop.
//! - **Terminated**: the task returns.
//!
//! Dropping every handle has the same effect as an explicit stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::instrument::WithSubscriber;

use crate::buffer::BufferStore;
use crate::flush::{FlushEngine, FlushReport};
use crate::metrics::BufferMetrics;
use crate::types::{Batch, FlushTrigger, Row};

/// Messages from handles to the control loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// Append a row to a destination's buffer
    Write { destination: String, row: Row },
    /// Flush every non-empty destination
    FlushAll,
    /// Report buffered row counts per destination
    Inspect(oneshot::Sender<HashMap<String, usize>>),
    /// Final flush, then terminate
    Stop,
}

pub(crate) struct ControlLoop {
    buffers: BufferStore,
    rx: mpsc::Receiver<Command>,
    engine: FlushEngine,
    max_age: Duration,
    tick_interval: Duration,
    in_flight: JoinSet<FlushReport>,
    metrics: Arc<BufferMetrics>,
}

impl ControlLoop {
    pub(crate) fn new(
        buffers: BufferStore,
        rx: mpsc::Receiver<Command>,
        engine: FlushEngine,
        max_age: Duration,
        tick_interval: Duration,
        metrics: Arc<BufferMetrics>,
    ) -> Self {
        Self {
            buffers,
            rx,
            engine,
            max_age,
            tick_interval,
            in_flight: JoinSet::new(),
            metrics,
        }
    }

    /// Runs until a stop command arrives or every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            destinations = self.buffers.iter().count(),
            tick_ms = self.tick_interval.as_millis() as u64,
            "control loop started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Write { destination, row }) => self.on_write(&destination, row),
                    Some(Command::FlushAll) => self.on_flush_all(),
                    Some(Command::Inspect(reply)) => {
                        // The caller may have given up waiting.
                        let _ = reply.send(self.buffers.lengths());
                    }
                    Some(Command::Stop) => {
                        tracing::info!("stop requested");
                        break;
                    }
                    None => {
                        tracing::info!("all handles dropped, stopping");
                        break;
                    }
                },
                _ = ticker.tick() => self.on_tick(),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    on_flush_done(joined);
                }
            }
        }

        self.stop().await;
    }

    fn on_write(&mut self, destination: &str, row: Row) {
        let Some(buffer) = self.buffers.get_mut(destination) else {
            tracing::warn!(destination = %destination, "dropping row for unknown destination");
            return;
        };

        self.metrics.record_row_accepted();
        let batch = if buffer.push(row) {
            buffer.swap(FlushTrigger::Capacity, Instant::now())
        } else {
            None
        };

        if let Some(batch) = batch {
            self.dispatch(batch);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let max_age = self.max_age;

        let due: Vec<Batch> = self
            .buffers
            .iter_mut()
            .filter(|b| b.is_due(now, max_age))
            .filter_map(|b| {
                let trigger = if b.is_full() {
                    FlushTrigger::Capacity
                } else {
                    FlushTrigger::MaxAge
                };
                b.swap(trigger, now)
            })
            .collect();

        for batch in due {
            self.dispatch(batch);
        }
    }

    fn on_flush_all(&mut self) {
        for batch in self.swap_all(FlushTrigger::Signal) {
            self.dispatch(batch);
        }
    }

    fn swap_all(&mut self, trigger: FlushTrigger) -> Vec<Batch> {
        let now = Instant::now();
        self.buffers
            .iter_mut()
            .filter_map(|b| b.swap(trigger, now))
            .collect()
    }

    /// Hands a batch to the flush engine without waiting for it.
    fn dispatch(&mut self, batch: Batch) {
        tracing::debug!(
            destination = %batch.destination.name(),
            rows = batch.len(),
            trigger = %batch.trigger,
            "dispatching flush"
        );

        let dispatch = self.engine.dispatch().clone();
        let flush = self.engine.clone().flush(batch);
        self.in_flight.spawn(flush.with_subscriber(dispatch));
    }

    async fn stop(mut self) {
        // Writers see `Stopped` from here on.
        self.rx.close();

        // Writes queued before the close were already accepted.
        let mut late = 0;
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Write { destination, row } = command {
                late += 1;
                self.on_write(&destination, row);
            }
        }
        if late > 0 {
            tracing::debug!(rows = late, "appended writes queued behind stop");
        }

        for batch in self.swap_all(FlushTrigger::Shutdown) {
            self.dispatch(batch);
        }

        let pending = self.in_flight.len();
        if pending > 0 {
            tracing::debug!(flushes = pending, "waiting for in-flight flushes");
        }
        while let Some(joined) = self.in_flight.join_next().await {
            on_flush_done(joined);
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            rows_accepted = snapshot.rows_accepted,
            rows_committed = snapshot.rows_committed,
            rows_skipped = snapshot.rows_skipped,
            rows_lost = snapshot.rows_lost,
            flushes = snapshot.flushes,
            chunks_failed = snapshot.chunks_failed,
            "control loop terminated"
        );
    }
}

fn on_flush_done(joined: Result<FlushReport, JoinError>) {
    match joined {
        Ok(report) if report.failed_chunks > 0 => {
            tracing::debug!(
                destination = %report.destination,
                lost = report.lost(),
                "flush finished with failures"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "flush task failed"),
    }
}

// =============================================================================
// Tests
// =============================================================================
