//! # Async API for tablebuffer
//!
//! [`TableBuffer`] is the entry point. Starting one validates the config and
//! every destination against the store, then spawns the control loop:
//!
//! ```text
//! TableBuffer::start(store, config)
//!     │
//!     ├─ resolve config          (Config error)
//!     ├─ probe destinations      (Probe error, blocking pool)
//!     └─ spawn control loop      (only if both succeeded)
//!
//! BufferHandle::write ──► mpsc (bounded) ──► control loop ──► flush engine
//! ```
//!
//! ## Backpressure
//!
//! The channel to the control loop is bounded. Producers choose how to wait:
//!
//! | Method | When the channel is full |
//! |--------|--------------------------|
//! | [`write`](BufferHandle::write) | awaits free capacity |
//! | [`try_write`](BufferHandle::try_write) | returns [`Error::Saturated`] |
//! | [`blocking_write`](BufferHandle::blocking_write) | blocks the calling OS thread |
//!
//! Every method returns [`Error::Stopped`] once the loop has stopped accepting
//! commands. A successful write means the row was queued; durability is
//! best-effort and failures surface in logs and [`MetricsSnapshot`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::{dispatcher, Dispatch};

use crate::buffer::BufferStore;
use crate::config::BufferConfig;
use crate::control::{Command, ControlLoop};
use crate::error::{Error, Result};
use crate::flush::FlushEngine;
use crate::metrics::{BufferMetrics, MetricsSnapshot};
use crate::store::BulkStore;
use crate::types::Row;
use crate::validate::validate;

// =============================================================================
// BufferHandle
// =============================================================================

/// A cloneable handle for producers.
///
/// Handles are cheap to clone and can be moved into any task or thread. When
/// the last handle (including the one inside [`TableBuffer`]) is dropped, the
/// control loop performs a final flush and terminates.
#[derive(Clone)]
pub struct BufferHandle {
    tx: mpsc::Sender<Command>,
    destinations: Arc<HashSet<String>>,
    metrics: Arc<BufferMetrics>,
}

impl BufferHandle {
    /// Queues a row for `destination`, waiting for channel capacity if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownDestination`] if the name is not configured
    /// - [`Error::Stopped`] if the buffer has stopped
    pub async fn write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        let command = self.write_command(destination, row.into())?;
        self.tx.send(command).await.map_err(|_| Error::Stopped)
    }

    /// Queues a row without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Saturated`] if the channel is full; the row was not queued
    /// - [`Error::UnknownDestination`] if the name is not configured
    /// - [`Error::Stopped`] if the buffer has stopped
    pub fn try_write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        let command = self.write_command(destination, row.into())?;
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Saturated,
            mpsc::error::TrySendError::Closed(_) => Error::Stopped,
        })
    }

    /// Queues a row from synchronous code, blocking the thread until there is
    /// capacity.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async execution context, like
    /// [`mpsc::Sender::blocking_send`].
    pub fn blocking_write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        let command = self.write_command(destination, row.into())?;
        self.tx.blocking_send(command).map_err(|_| Error::Stopped)
    }

    /// Asks the control loop to flush every non-empty destination.
    ///
    /// Ordered after every write queued before it. Returns once the request is
    /// queued, not when the flush has committed.
    pub async fn flush_all(&self) -> Result<()> {
        self.tx
            .send(Command::FlushAll)
            .await
            .map_err(|_| Error::Stopped)
    }

    /// Asks the control loop to flush everything and terminate.
    ///
    /// Returns once the request is queued. Use [`TableBuffer::join`] or
    /// [`TableBuffer::shutdown`] to wait for termination.
    pub async fn stop(&self) -> Result<()> {
        self.tx.send(Command::Stop).await.map_err(|_| Error::Stopped)
    }

    /// Rows currently held in each destination's live buffer.
    pub async fn buffered_rows(&self) -> Result<HashMap<String, usize>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Inspect(reply))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns true once the control loop has stopped accepting commands.
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    fn write_command(&self, destination: &str, row: Row) -> Result<Command> {
        if !self.destinations.contains(destination) {
            return Err(Error::UnknownDestination(destination.to_string()));
        }
        Ok(Command::Write {
            destination: destination.to_string(),
            row,
        })
    }
}

// =============================================================================
// TableBuffer
// =============================================================================

/// Owner of a running buffer.
///
/// # Example
///
/// ```rust,ignore
/// use tablebuffer::{row, BufferConfig, DestinationConfig, SqliteStore, TableBuffer};
///
/// #[tokio::main]
/// async fn main() -> tablebuffer::Result<()> {
///     let store = SqliteStore::open("metrics.db")?;
///     let config = BufferConfig::new(vec![
///         DestinationConfig::new("events", ["time", "data"]),
///     ])
///     .with_workers(4);
///
///     let buffer = TableBuffer::start(store, config).await?;
///     buffer.write("events", row![1_700_000_000_i64, "login"]).await?;
///
///     // Flushes whatever is left and waits for every commit to finish.
///     buffer.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct TableBuffer {
    handle: BufferHandle,
    task: JoinHandle<()>,
}

impl TableBuffer {
    /// Validates `config` against `store` and starts the control loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or [`Error::Probe`] before any background
    /// task is started.
    pub async fn start<S: BulkStore>(store: S, config: BufferConfig) -> Result<Self> {
        let settings = config.resolve()?;
        let store: Arc<dyn BulkStore> = Arc::new(store);

        let probe_store = Arc::clone(&store);
        let probe_destinations = settings.destinations.clone();
        tokio::task::spawn_blocking(move || {
            validate(
                probe_store.as_ref(),
                probe_destinations.iter().map(|d| d.as_ref()),
            )
        })
        .await
        .map_err(|e| Error::Config(format!("destination validation did not finish: {e}")))??;

        let dispatch = config
            .logger
            .unwrap_or_else(|| dispatcher::get_default(Dispatch::clone));

        let metrics = Arc::new(BufferMetrics::new());
        let engine = FlushEngine::new(
            store,
            settings.workers,
            settings.row_failure,
            Arc::clone(&metrics),
            dispatch.clone(),
        );

        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        let destinations = settings
            .destinations
            .iter()
            .map(|d| d.name().to_string())
            .collect();

        let control = ControlLoop::new(
            BufferStore::new(&settings.destinations, Instant::now()),
            rx,
            engine,
            settings.max_age,
            settings.tick_interval,
            Arc::clone(&metrics),
        );

        dispatcher::with_default(&dispatch, || {
            tracing::info!(
                destinations = settings.destinations.len(),
                workers = settings.workers,
                max_age_ms = settings.max_age.as_millis() as u64,
                "table buffer started"
            );
        });

        let task = tokio::spawn(control.run().with_subscriber(dispatch));

        Ok(Self {
            handle: BufferHandle {
                tx,
                destinations: Arc::new(destinations),
                metrics,
            },
            task,
        })
    }

    /// Returns a new handle for producers.
    pub fn handle(&self) -> BufferHandle {
        self.handle.clone()
    }

    /// See [`BufferHandle::write`].
    pub async fn write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        self.handle.write(destination, row).await
    }

    /// See [`BufferHandle::try_write`].
    pub fn try_write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        self.handle.try_write(destination, row)
    }

    /// See [`BufferHandle::blocking_write`].
    pub fn blocking_write(&self, destination: &str, row: impl Into<Row>) -> Result<()> {
        self.handle.blocking_write(destination, row)
    }

    /// See [`BufferHandle::flush_all`].
    pub async fn flush_all(&self) -> Result<()> {
        self.handle.flush_all().await
    }

    /// See [`BufferHandle::stop`].
    pub async fn stop(&self) -> Result<()> {
        self.handle.stop().await
    }

    /// See [`BufferHandle::buffered_rows`].
    pub async fn buffered_rows(&self) -> Result<HashMap<String, usize>> {
        self.handle.buffered_rows().await
    }

    /// See [`BufferHandle::metrics`].
    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle.metrics()
    }

    /// Flushes every destination and waits for the control loop to terminate.
    ///
    /// When this returns, every flush has finished and the store is no longer
    /// used.
    pub async fn shutdown(self) {
        // Already stopped is fine: join below still waits for termination.
        let _ = self.handle.stop().await;
        self.join().await;
    }

    /// Waits for the control loop to terminate after a stop sent elsewhere.
    ///
    /// Dropping this `TableBuffer`'s own handle here means the loop will also
    /// stop once every other handle is gone.
    pub async fn join(self) {
        let Self { handle, task } = self;
        drop(handle);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "control loop panicked");
        }
    }
}
