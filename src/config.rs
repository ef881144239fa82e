//! # Buffer Configuration
//!
//! Destinations and global defaults for a [`TableBuffer`](crate::TableBuffer).
//!
//! The structs deserialize with serde so they can be embedded in an
//! application's own config file. Loading that file is the application's job.
//!
//! ```toml
//! capacity = 1000
//! workers = 4
//! max_age = "5s"
//! row_failure = "abort_chunk"
//!
//! [[destinations]]
//! name = "events"
//! columns = ["time", "data"]
//!
//! [[destinations]]
//! name = "audit"
//! columns = ["time", "actor", "action"]
//! capacity = 50
//! ```
//!
//! ## Zero Means Default
//!
//! A zero capacity, worker count or channel size is treated as "unset" and
//! replaced by the default when the config is resolved. A destination without
//! its own capacity inherits the global one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::Dispatch;

use crate::error::{Error, Result};
use crate::types::Destination;

// =============================================================================
// Defaults
// =============================================================================

/// Default rows per destination before a size-triggered flush.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default number of parallel bulk writers per flush.
pub const DEFAULT_WORKERS: usize = 1;

/// Default maximum time rows may sit in a buffer.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(1);

/// Default bound of the event channel feeding the control loop.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Shortest allowed timer tick.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Row Failure Policy
// =============================================================================

/// What a bulk writer does when the store rejects a single row.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    /// Roll back the whole chunk on the first rejected row (default).
    #[default]
    AbortChunk,
    /// Log the rejected row, drop it, and keep streaming the rest of the chunk.
    ///
    /// Only meaningful for stores that keep a transaction usable after a
    /// statement-level failure (SQLite does, PostgreSQL `COPY` does not).
    SkipRow,
}

// =============================================================================
// Destination Configuration
// =============================================================================

/// One destination: a table name, its ordered columns, and an optional capacity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DestinationConfig {
    /// Destination name, used as the table name by the bulk statement
    pub name: String,

    /// Ordered column list; every row must supply values in this order
    pub columns: Vec<String>,

    /// Rows before a size-triggered flush. `None` or 0 inherits the global capacity.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl DestinationConfig {
    /// Creates a destination that inherits the global capacity.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            capacity: None,
        }
    }

    /// Sets a per-destination capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

// =============================================================================
// Buffer Configuration
// =============================================================================

/// Configuration for a [`TableBuffer`](crate::TableBuffer).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Destinations to buffer for. Must not be empty.
    pub destinations: Vec<DestinationConfig>,

    /// Global capacity for destinations that don't set their own.
    /// Default: 1000
    pub capacity: usize,

    /// Parallel bulk writers per flush.
    /// Default: 1
    pub workers: usize,

    /// Rows older than this (measured from the destination's last flush) are
    /// flushed on the next timer tick.
    /// Default: 1s
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Timer period. Defaults to `max_age`, never below 10ms.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Option<Duration>,

    /// Bound of the event channel. Writers wait (or are rejected by
    /// `try_write`) once this many events are queued.
    /// Default: 1000
    pub channel_capacity: usize,

    /// Per-row failure handling inside a chunk.
    /// Default: abort_chunk
    pub row_failure: RowFailurePolicy,

    /// Logging sink for the control loop and flush tasks.
    ///
    /// `None` uses whatever dispatcher is current when the buffer starts, which
    /// is tracing's no-op dispatcher if the application never installed one.
    #[serde(skip)]
    pub logger: Option<Dispatch>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            workers: DEFAULT_WORKERS,
            max_age: DEFAULT_MAX_AGE,
            tick_interval: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            row_failure: RowFailurePolicy::AbortChunk,
            logger: None,
        }
    }
}

impl BufferConfig {
    /// Creates a config for the given destinations with all defaults.
    pub fn new(destinations: Vec<DestinationConfig>) -> Self {
        Self {
            destinations,
            ..Self::default()
        }
    }

    /// Adds a destination.
    pub fn with_destination(mut self, destination: DestinationConfig) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Sets the global capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the number of parallel writers per flush.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the maximum buffering age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Sets the timer period.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = Some(tick_interval);
        self
    }

    /// Sets the event channel bound.
    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }

    /// Sets the per-row failure policy.
    pub fn with_row_failure(mut self, policy: RowFailurePolicy) -> Self {
        self.row_failure = policy;
        self
    }

    /// Sets the logging sink.
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Checks the config's shape and fills in defaults.
    ///
    /// This does not touch the store; probing happens in
    /// [`validate`](crate::validate::validate).
    pub(crate) fn resolve(&self) -> Result<Settings> {
        if self.destinations.is_empty() {
            return Err(Error::Config("no destinations configured".to_string()));
        }

        let capacity = non_zero_or(self.capacity, DEFAULT_CAPACITY);
        let mut seen = HashSet::new();
        let mut destinations = Vec::with_capacity(self.destinations.len());

        for dest in &self.destinations {
            if dest.name.trim().is_empty() {
                return Err(Error::Config("destination name is empty".to_string()));
            }
            if dest.columns.is_empty() {
                return Err(Error::Config(format!(
                    "destination '{}' has no columns",
                    dest.name
                )));
            }
            if !seen.insert(dest.name.as_str()) {
                return Err(Error::Config(format!(
                    "destination '{}' is configured more than once",
                    dest.name
                )));
            }

            let dest_capacity = dest
                .capacity
                .filter(|&c| c > 0)
                .unwrap_or(capacity);

            destinations.push(Arc::new(Destination::new(
                dest.name.clone(),
                dest.columns.clone(),
                dest_capacity,
            )));
        }

        let tick_interval = self
            .tick_interval
            .unwrap_or(self.max_age)
            .max(MIN_TICK_INTERVAL);

        Ok(Settings {
            destinations,
            workers: non_zero_or(self.workers, DEFAULT_WORKERS),
            max_age: self.max_age,
            tick_interval,
            channel_capacity: non_zero_or(self.channel_capacity, DEFAULT_CHANNEL_CAPACITY),
            row_failure: self.row_failure,
        })
    }
}

fn non_zero_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// A [`BufferConfig`] with every default applied.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) destinations: Vec<Arc<Destination>>,
    pub(crate) workers: usize,
    pub(crate) max_age: Duration,
    pub(crate) tick_interval: Duration,
    pub(crate) channel_capacity: usize,
    pub(crate) row_failure: RowFailurePolicy,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> DestinationConfig {
        DestinationConfig::new("events", ["time", "data"])
    }

    #[test]
    fn test_default_config() {
        let config = BufferConfig::default();
        assert!(config.destinations.is_empty());
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.workers, 1);
        assert_eq!(config.max_age, Duration::from_secs(1));
        assert_eq!(config.tick_interval, None);
        assert_eq!(config.channel_capacity, 1000);
        assert_eq!(config.row_failure, RowFailurePolicy::AbortChunk);
        assert!(config.logger.is_none());
    }

    #[test]
    fn test_resolve_rejects_empty_destinations() {
        let err = BufferConfig::default().resolve().unwrap_err();
        assert!(err.is_config());
        assert_eq!(err.to_string(), "config error: no destinations configured");
    }

    #[test]
    fn test_resolve_rejects_bad_destinations() {
        let no_columns = BufferConfig::new(vec![DestinationConfig::new(
            "events",
            Vec::<String>::new(),
        )]);
        assert!(no_columns.resolve().unwrap_err().is_config());

        let no_name = BufferConfig::new(vec![DestinationConfig::new(" ", ["a"])]);
        assert!(no_name.resolve().unwrap_err().is_config());

        let duplicate = BufferConfig::new(vec![events(), events()]);
        let err = duplicate.resolve().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let config = BufferConfig::new(vec![events(), DestinationConfig::new("audit", ["a"]).with_capacity(50)])
            .with_capacity(0)
            .with_workers(0)
            .with_channel_capacity(0);

        let settings = config.resolve().unwrap();
        assert_eq!(settings.destinations[0].capacity(), DEFAULT_CAPACITY);
        assert_eq!(settings.destinations[1].capacity(), 50);
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_destination_zero_capacity_inherits_global() {
        let config = BufferConfig::new(vec![events().with_capacity(0)]).with_capacity(7);
        let settings = config.resolve().unwrap();
        assert_eq!(settings.destinations[0].capacity(), 7);
    }

    #[test]
    fn test_tick_interval_defaults_to_max_age() {
        let settings = BufferConfig::new(vec![events()])
            .with_max_age(Duration::from_millis(250))
            .resolve()
            .unwrap();
        assert_eq!(settings.tick_interval, Duration::from_millis(250));

        let settings = BufferConfig::new(vec![events()])
            .with_max_age(Duration::ZERO)
            .resolve()
            .unwrap();
        assert_eq!(settings.tick_interval, MIN_TICK_INTERVAL);

        let settings = BufferConfig::new(vec![events()])
            .with_tick_interval(Duration::from_millis(20))
            .resolve()
            .unwrap();
        assert_eq!(settings.tick_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_deserialize_empty() {
        let config: BufferConfig = toml::from_str("").unwrap();
        assert!(config.destinations.is_empty());
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.max_age, Duration::from_secs(1));
    }

    #[test]
    fn test_deserialize_full() {
        let toml = r#"
capacity = 500
workers = 4
max_age = "5s"
tick_interval = "250ms"
channel_capacity = 64
row_failure = "skip_row"

[[destinations]]
name = "events"
columns = ["time", "data"]

[[destinations]]
name = "audit"
columns = ["time", "actor", "action"]
capacity = 50
"#;
        let config: BufferConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.capacity, 500);
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_age, Duration::from_secs(5));
        assert_eq!(config.tick_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.row_failure, RowFailurePolicy::SkipRow);
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0], events());
        assert_eq!(config.destinations[1].capacity, Some(50));
    }

    #[test]
    fn test_deserialize_max_age_variants() {
        for (s, expected) in [
            ("100ms", Duration::from_millis(100)),
            ("1s", Duration::from_secs(1)),
            ("30s", Duration::from_secs(30)),
            ("1m", Duration::from_secs(60)),
        ] {
            let toml = format!("max_age = \"{}\"", s);
            let config: BufferConfig = toml::from_str(&toml).unwrap();
            assert_eq!(config.max_age, expected, "Failed for {}", s);
        }
    }
}
