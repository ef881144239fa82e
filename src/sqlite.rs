//! # SQLite Bulk Store
//!
//! A [`BulkStore`] backed by a SQLite database file.
//!
//! ## Mapping the Bulk-Load Capability onto SQLite
//!
//! SQLite has no `COPY`. The cheapest equivalent is one prepared `INSERT`
//! executed once per row inside a single transaction:
//!
//! ```text
//! begin      → BEGIN IMMEDIATE
//! prepare    → INSERT INTO "events" ("time", "data") VALUES (?1, ?2)   (cached)
//! stream_row → execute cached statement with the row's values
//! finalize   → release the cached statement
//! commit     → COMMIT          (ROLLBACK if COMMIT fails)
//! rollback   → ROLLBACK
//! ```
//!
//! ## Connections
//!
//! A `Connection` is `Send` but not `Sync`, so every transaction takes a
//! connection out of a small idle pool and owns it until commit or rollback,
//! then hands it back. Concurrent chunks therefore use separate connections.
//! SQLite still admits one writer at a time; `BEGIN IMMEDIATE` plus a busy
//! timeout makes the other workers queue for the write lock instead of failing.
//!
//! WAL mode is enabled when the store is opened so readers are never blocked by
//! a flush in progress.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::types::{Null, ToSqlOutput};
use rusqlite::{params_from_iter, Connection, OpenFlags, ToSql};

use crate::error::{Result, StoreError};
use crate::store::{BulkStore, BulkTransaction};
use crate::types::{Row, Value};

// =============================================================================
// Configuration
// =============================================================================

/// How long a worker waits for SQLite's write lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of idle connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 16;

// =============================================================================
// Value Binding
// =============================================================================

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::from(Null)),
            Value::Bool(v) => v.to_sql(),
            Value::Integer(v) => v.to_sql(),
            Value::Real(v) => v.to_sql(),
            Value::Text(v) => v.to_sql(),
            Value::Blob(v) => v.to_sql(),
            Value::Timestamp(v) => v.to_sql(),
        }
    }
}

/// Quotes an identifier for use in SQL, doubling embedded quotes.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the bulk `INSERT` for a destination.
fn insert_sql(destination: &str, columns: &[String]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(destination),
        column_list,
        placeholders
    )
}

// =============================================================================
// Connection Pool
// =============================================================================

#[derive(Debug)]
struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn checkout(&self) -> rusqlite::Result<Connection> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match reused {
            Some(conn) => Ok(conn),
            None => self.open_connection(),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

// =============================================================================
// SqliteStore
// =============================================================================

/// A SQLite database file used as a bulk-load target.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```rust,no_run
/// use tablebuffer::SqliteStore;
///
/// let store = SqliteStore::open("events.db")?;
/// # Ok::<(), tablebuffer::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Arc<ConnectionPool>,
}

impl SqliteStore {
    /// Opens (or creates) a database file and switches it to WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a database file with a custom busy timeout.
    pub fn open_with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let pool = ConnectionPool {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            idle: Mutex::new(Vec::new()),
        };

        let conn = pool.open_connection()?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        pool.checkin(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.pool.path
    }

    /// Runs arbitrary SQL (schema setup, for example) on a pooled connection.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.pool.checkout()?;
        let result = conn.execute_batch(sql);
        self.pool.checkin(conn);
        Ok(result?)
    }
}

impl BulkStore for SqliteStore {
    fn begin(&self) -> std::result::Result<Box<dyn BulkTransaction>, StoreError> {
        let conn = self.pool.checkout()?;

        if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
            self.pool.checkin(conn);
            return Err(e.into());
        }

        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
            pool: Arc::clone(&self.pool),
            sql: None,
        }))
    }
}

// =============================================================================
// SqliteTransaction
// =============================================================================

/// An open `BEGIN IMMEDIATE` transaction on a pooled connection.
struct SqliteTransaction {
    /// `None` once the transaction has been committed or rolled back.
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    /// SQL of the prepared bulk statement, used as the statement cache key.
    sql: Option<String>,
}

impl SqliteTransaction {
    fn conn(&self) -> std::result::Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| "transaction already finished".into())
    }

    /// Ends the transaction with `sql` and returns the connection to the pool.
    fn finish(&mut self, sql: &str) -> std::result::Result<(), StoreError> {
        let conn = self
            .conn
            .take()
            .ok_or("transaction already finished")?;

        let result = conn.execute_batch(sql);
        if result.is_err() && !conn.is_autocommit() {
            let _ = conn.execute_batch("ROLLBACK");
        }
        self.pool.checkin(conn);
        Ok(result?)
    }
}

impl BulkTransaction for SqliteTransaction {
    fn prepare(&mut self, destination: &str, columns: &[String]) -> std::result::Result<(), StoreError> {
        let sql = insert_sql(destination, columns);
        self.conn()?.prepare_cached(&sql)?;
        self.sql = Some(sql);
        Ok(())
    }

    fn stream_row(&mut self, row: &Row) -> std::result::Result<(), StoreError> {
        let sql = self.sql.as_deref().ok_or("bulk statement not prepared")?;
        let mut stmt = self.conn()?.prepare_cached(sql)?;
        stmt.execute(params_from_iter(row.values()))?;
        Ok(())
    }

    fn finalize(&mut self) -> std::result::Result<(), StoreError> {
        self.sql.take().ok_or("bulk statement not prepared")?;
        self.conn()?.flush_prepared_statement_cache();
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> std::result::Result<(), StoreError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> std::result::Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.execute_batch("ROLLBACK");
            self.pool.checkin(conn);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
