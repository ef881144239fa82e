#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tablebuffer::{BulkStore, BulkTransaction, Row, SqliteStore, StoreError, Value};

// =============================================================================
// SQLite helpers
// =============================================================================

pub fn create_temp_store(name: &str, ddl: &str) -> (tempfile::TempDir, PathBuf, SqliteStore) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let store = SqliteStore::open(&path).expect("open store");
    store.execute_batch(ddl).expect("create tables");
    (dir, path, store)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count_rows(path: &Path, table: &str) -> i64 {
    open_read_only(path)
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .expect("count rows")
}

pub fn read_ids(path: &Path, table: &str) -> Vec<i64> {
    let conn = open_read_only(path);
    let mut stmt = conn
        .prepare(&format!("SELECT id FROM {} ORDER BY rowid", table))
        .expect("prepare select");
    stmt.query_map([], |row| row.get(0))
        .expect("query ids")
        .collect::<Result<Vec<_>, _>>()
        .expect("read ids")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Recording store
// =============================================================================

/// One committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub destination: String,
    pub rows: Vec<Row>,
}

#[derive(Default)]
struct Inner {
    commits: Mutex<Vec<Commit>>,
    missing_tables: Mutex<HashSet<String>>,
    rejected: Mutex<Option<Value>>,
    fail_begin: AtomicBool,
    commit_delay: Mutex<Duration>,
    rollbacks: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// In-memory store that records every committed chunk.
///
/// Failures can be injected per phase: unknown tables fail `prepare`, a
/// rejected value fails `stream_row` for any row whose first cell matches it,
/// and `fail_begin` makes every `begin` fail.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: Arc<Inner>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing_table(self, name: &str) -> Self {
        self.inner
            .missing_tables
            .lock()
            .unwrap()
            .insert(name.to_string());
        self
    }

    pub fn with_commit_delay(self, delay: Duration) -> Self {
        *self.inner.commit_delay.lock().unwrap() = delay;
        self
    }

    pub fn reject_rows_starting_with(&self, value: impl Into<Value>) {
        *self.inner.rejected.lock().unwrap() = Some(value.into());
    }

    pub fn fail_begin(&self, fail: bool) {
        self.inner.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.inner.commits.lock().unwrap().clone()
    }

    /// Every committed row for `destination`, chunks in commit order.
    pub fn committed_rows(&self, destination: &str) -> Vec<Row> {
        self.commits()
            .into_iter()
            .filter(|c| c.destination == destination)
            .flat_map(|c| c.rows)
            .collect()
    }

    pub fn committed_count(&self) -> usize {
        self.commits().iter().map(|c| c.rows.len()).sum()
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_transactions(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }
}

impl BulkStore for RecordingStore {
    fn begin(&self) -> Result<Box<dyn BulkTransaction>, StoreError> {
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(RecordingTransaction {
            inner: Arc::clone(&self.inner),
            destination: None,
            rows: Vec::new(),
        }))
    }
}

struct RecordingTransaction {
    inner: Arc<Inner>,
    destination: Option<String>,
    rows: Vec<Row>,
}

impl BulkTransaction for RecordingTransaction {
    fn prepare(&mut self, destination: &str, _columns: &[String]) -> Result<(), StoreError> {
        if self.inner.missing_tables.lock().unwrap().contains(destination) {
            return Err(format!("relation \"{}\" does not exist", destination).into());
        }
        self.destination = Some(destination.to_string());
        Ok(())
    }

    fn stream_row(&mut self, row: &Row) -> Result<(), StoreError> {
        if let Some(rejected) = self.inner.rejected.lock().unwrap().as_ref() {
            if row.values().first() == Some(rejected) {
                return Err("row rejected".into());
            }
        }
        self.rows.push(row.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let delay = *self.inner.commit_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let destination = self.destination.take().ok_or("commit without prepare")?;
        let rows = std::mem::take(&mut self.rows);
        self.inner
            .commits
            .lock()
            .unwrap()
            .push(Commit { destination, rows });
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RecordingTransaction {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
