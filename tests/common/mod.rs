#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sql_dispatch::prelude::*;
use tempfile::tempdir;

/// Observer that records every state it is handed.
pub fn recording_observer() -> (CallObserver, Arc<Mutex<Vec<CallState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: CallObserver = Arc::new(move |state: CallState, _call: &Call| {
        sink.lock().unwrap().push(state);
    });
    (observer, seen)
}

pub fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // Leak the tempdir so the file persists for the duration of the test binary.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

/// A file-backed SQLite database holding the `test_table` / `test_view` fixture.
#[cfg(feature = "sqlite")]
pub fn seeded_sqlite(prefix: &str) -> String {
    let path = unique_db_path(prefix);
    let conn = rusqlite::Connection::open(&path).expect("open fixture db");
    conn.execute_batch(
        "CREATE TABLE test_table (id INTEGER PRIMARY KEY, username TEXT NOT NULL, email TEXT);
         INSERT INTO test_table (id, username, email) VALUES
             (1, 'john_doe', 'john@example.com'),
             (2, 'jane_smith', 'jane@example.com'),
             (3, 'bob_wilson', 'bob@example.com');
         CREATE VIEW test_view AS SELECT id, username FROM test_table WHERE id = 2;",
    )
    .expect("seed fixture db");
    path
}

#[cfg(feature = "sqlite")]
pub fn sqlite_connection(path: &str, options: CallOptions) -> Connection {
    let params = ConnectionParams::new("sqlite-test", "fixture", "sqlite", path);
    Connection::new(params, &AdapterRegistry::with_defaults(), options).expect("sqlite connection")
}

/// Counters shared between a [`MockAdapter`] and the test that drives it.
#[derive(Debug, Default)]
pub struct MockStats {
    pub queries: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub rows_served: AtomicUsize,
    pub interrupted: AtomicBool,
    pub closed: AtomicBool,
}

/// Scripted adapter: every query yields the same header and rows.
#[derive(Clone)]
pub struct MockAdapter {
    pub header: Header,
    pub rows: Vec<Row>,
    pub query_delay: Duration,
    pub row_delay: Duration,
    pub fail_query: Option<String>,
    /// Fail with an iteration error after this many rows.
    pub fail_after: Option<usize>,
    pub concurrency_safe: bool,
    pub stats: Arc<MockStats>,
}

impl MockAdapter {
    pub fn numbers(n: i64) -> Self {
        Self {
            header: vec!["n".into()],
            rows: (0..n).map(|i| vec![RowValues::Int(i)]).collect(),
            query_delay: Duration::ZERO,
            row_delay: Duration::ZERO,
            fail_query: None,
            fail_after: None,
            concurrency_safe: true,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = delay;
        self
    }

    pub fn failing_query(mut self, message: &str) -> Self {
        self.fail_query = Some(message.to_owned());
        self
    }

    pub fn failing_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub fn serialized(mut self) -> Self {
        self.concurrency_safe = false;
        self
    }

    pub fn connection(&self, options: CallOptions) -> Connection {
        let params = ConnectionParams::new("mock", "scripted", "mock", "mock://");
        Connection::with_adapter(params, Arc::new(self.clone()), options)
    }

    /// A registry that builds this adapter for the `mock` tag.
    pub fn registry(&self) -> AdapterRegistry {
        let template = self.clone();
        let mut registry = AdapterRegistry::new();
        registry.register("mock", move |_params: &ConnectionParams| {
            Ok(Arc::new(template.clone()) as SharedQuerier)
        });
        registry
    }
}

#[async_trait]
impl Querier for MockAdapter {
    async fn query(&self, query: &str) -> Result<Box<dyn RowIterator>, SqlDispatchError> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        let active = ActiveGuard::enter(Arc::clone(&self.stats));
        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        if let Some(message) = &self.fail_query {
            return Err(SqlDispatchError::QueryError(message.clone()));
        }
        Ok(Box::new(MockRows {
            meta: Meta::new(query),
            header: self.header.clone(),
            rows: self.rows.clone(),
            next: 0,
            row_delay: self.row_delay,
            fail_after: self.fail_after,
            active: Some(active),
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn close(&self) {
        self.stats.closed.store(true, Ordering::SeqCst);
    }

    fn interrupt(&self) {
        self.stats.interrupted.store(true, Ordering::SeqCst);
    }

    fn is_concurrency_safe(&self) -> bool {
        self.concurrency_safe
    }
}

struct MockRows {
    meta: Meta,
    header: Header,
    rows: Vec<Row>,
    next: usize,
    row_delay: Duration,
    fail_after: Option<usize>,
    active: Option<ActiveGuard>,
    stats: Arc<MockStats>,
}

#[async_trait]
impl RowIterator for MockRows {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn header(&self) -> Result<Header, SqlDispatchError> {
        Ok(self.header.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SqlDispatchError> {
        if self.active.is_none() || self.next >= self.rows.len() {
            self.active = None;
            return Ok(None);
        }
        if self.fail_after == Some(self.next) {
            return Err(SqlDispatchError::IterationError(format!(
                "stream broke after {} rows",
                self.next
            )));
        }
        if !self.row_delay.is_zero() {
            tokio::time::sleep(self.row_delay).await;
        }
        let row = self.rows[self.next].clone();
        self.next += 1;
        self.stats.rows_served.fetch_add(1, Ordering::SeqCst);
        Ok(Some(row))
    }

    async fn close(&mut self) {
        self.active = None;
    }
}

/// Counts a query as active from `query()` until its rows are closed or exhausted.
struct ActiveGuard(Arc<MockStats>);

impl ActiveGuard {
    fn enter(stats: Arc<MockStats>) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}
