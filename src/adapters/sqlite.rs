use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{InterruptHandle, OpenFlags};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use super::{ColumnsQuery, DatabaseSwitcher, Querier, SchemaQuery, StructureQuery};
use crate::error::SqlDispatchError;
use crate::results::RowIterator;
use crate::schema::{TableOptions, quote_literal};
use crate::types::{Header, Meta, Row, RowValues};

/// Rows the worker may run ahead of the reader before it blocks.
const ROW_BUFFER: usize = 64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedSqliteConnection = Arc<Mutex<Option<rusqlite::Connection>>>;

/// `SQLite` adapter over a single connection handle.
///
/// The handle is not safe for concurrent use, so the adapter reports itself as needing
/// serialized access and every query holds the handle until its rows are drained or dropped.
pub struct SqliteAdapter {
    conn: SharedSqliteConnection,
    interrupt: Arc<InterruptHandle>,
    path: String,
}

impl SqliteAdapter {
    /// Open the database at `url`.
    ///
    /// Accepts a plain path, a `sqlite://` or `sqlite:` prefixed path, an SQLite `file:` URI,
    /// or `:memory:` (also the empty string).
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` if the database cannot be opened.
    pub fn open(url: &str) -> Result<Self, SqlDispatchError> {
        let path = strip_scheme(url);
        let conn = if path.is_empty() || path == ":memory:" {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open_with_flags(path, OpenFlags::default())
        }
        .map_err(|e| {
            SqlDispatchError::ConfigError(format!("failed to open SQLite database {path}: {e}"))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        debug!(path, "opened SQLite database");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
            path: path.to_owned(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

#[async_trait]
impl Querier for SqliteAdapter {
    async fn query(&self, query: &str) -> Result<Box<dyn RowIterator>, SqlDispatchError> {
        let meta = Meta::new(query);
        let (header_tx, header_rx) = oneshot::channel();
        let (row_tx, row_rx) = mpsc::channel(ROW_BUFFER);
        let conn = Arc::clone(&self.conn);
        let sql = query.to_owned();

        tokio::task::spawn_blocking(move || stream_rows(&conn, &sql, header_tx, &row_tx));

        let header = header_rx.await.map_err(|_| {
            SqlDispatchError::ConnectionError("SQLite worker dropped while preparing query".into())
        })??;

        Ok(Box::new(SqliteRows {
            meta,
            header,
            rows: Some(row_rx),
        }))
    }

    async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err((_, err)) = conn.close() {
                warn!(path = %self.path, error = %err, "closing SQLite database failed");
            }
        }
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    fn is_concurrency_safe(&self) -> bool {
        false
    }

    fn as_schema(&self) -> Option<&dyn SchemaQuery> {
        Some(self)
    }

    fn as_columns(&self) -> Option<&dyn ColumnsQuery> {
        Some(self)
    }

    fn as_structure(&self) -> Option<&dyn StructureQuery> {
        Some(self)
    }

    fn as_database_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        Some(self)
    }
}

const OBJECTS: &str = "FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'";

impl SchemaQuery for SqliteAdapter {
    fn schema_query(&self) -> String {
        format!("SELECT 'main', name {OBJECTS} ORDER BY name")
    }
}

impl StructureQuery for SqliteAdapter {
    fn structure_query(&self) -> String {
        format!("SELECT 'main', name, type {OBJECTS} ORDER BY type, name")
    }
}

impl ColumnsQuery for SqliteAdapter {
    fn columns_query(&self, opts: &TableOptions) -> String {
        let table = quote_literal(&opts.table);
        if opts.schema.is_empty() {
            format!("SELECT name, type FROM pragma_table_info({table}) ORDER BY cid")
        } else {
            let schema = quote_literal(&opts.schema);
            format!("SELECT name, type FROM pragma_table_info({table}, {schema}) ORDER BY cid")
        }
    }
}

// A single-file database has no siblings to switch to.
#[async_trait]
impl DatabaseSwitcher for SqliteAdapter {
    async fn select_database(&self, name: &str) -> Result<(), SqlDispatchError> {
        debug!(name, "SQLite has no databases to switch between; ignoring");
        Ok(())
    }

    async fn list_databases(&self) -> Result<(String, Vec<String>), SqlDispatchError> {
        let attached = run_blocking(Arc::clone(&self.conn), |conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_database_list ORDER BY seq")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await?;
        let others = attached
            .into_iter()
            .filter(|n| n != "main" && n != "temp")
            .collect();
        Ok(("main".to_string(), others))
    }
}

async fn run_blocking<F, R>(conn: SharedSqliteConnection, func: F) -> Result<R, SqlDispatchError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, SqlDispatchError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        let conn = guard.as_mut().ok_or_else(closed_error)?;
        func(conn)
    })
    .await
    .map_err(|e| SqlDispatchError::Other(format!("sqlite spawn_blocking join error: {e}")))?
}

fn closed_error() -> SqlDispatchError {
    SqlDispatchError::ConnectionError("SQLite database is closed".into())
}

/// Runs on a blocking thread: prepares `sql`, reports the header (or the error) through
/// `header_tx`, then streams rows until the result ends or the reader goes away.
///
/// The first row is stepped before the header is reported so that statements which fail at
/// run time fail the query rather than the iteration.
fn stream_rows(
    conn: &Mutex<Option<rusqlite::Connection>>,
    sql: &str,
    header_tx: oneshot::Sender<Result<Header, SqlDispatchError>>,
    row_tx: &mpsc::Sender<Result<Row, SqlDispatchError>>,
) {
    let guard = conn.blocking_lock();
    let Some(conn) = guard.as_ref() else {
        let _ = header_tx.send(Err(closed_error()));
        return;
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = header_tx.send(Err(query_error(&err)));
            return;
        }
    };
    let header: Header = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let width = header.len();

    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = header_tx.send(Err(query_error(&err)));
            return;
        }
    };
    let first = match rows.next() {
        Ok(first) => first.map(|row| extract_row(row, width)),
        Err(err) => {
            let _ = header_tx.send(Err(query_error(&err)));
            return;
        }
    };
    if header_tx.send(Ok(header)).is_err() {
        return;
    }
    let Some(first) = first else {
        return;
    };
    if row_tx.blocking_send(first).is_err() {
        return;
    }

    loop {
        let next = match rows.next() {
            Ok(Some(row)) => extract_row(row, width),
            Ok(None) => return,
            Err(err) => Err(SqlDispatchError::IterationError(err.to_string())),
        };
        let failed = next.is_err();
        // A closed channel means the reader closed the iterator early.
        if row_tx.blocking_send(next).is_err() || failed {
            return;
        }
    }
}

fn query_error(err: &rusqlite::Error) -> SqlDispatchError {
    SqlDispatchError::QueryError(err.to_string())
}

fn extract_row(row: &rusqlite::Row<'_>, width: usize) -> Result<Row, SqlDispatchError> {
    (0..width).map(|idx| extract_value(row, idx)).collect()
}

/// Extract a `RowValues` from a `SQLite` row.
fn extract_value(row: &rusqlite::Row<'_>, idx: usize) -> Result<RowValues, SqlDispatchError> {
    let value = row
        .get_ref(idx)
        .map_err(|e| SqlDispatchError::IterationError(e.to_string()))?;
    Ok(match value {
        ValueRef::Null => RowValues::Null,
        ValueRef::Integer(i) => RowValues::Int(i),
        ValueRef::Real(f) => RowValues::Float(f),
        ValueRef::Text(bytes) => RowValues::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(b) => RowValues::Blob(b.to_vec()),
    })
}

struct SqliteRows {
    meta: Meta,
    header: Header,
    // Dropping the receiver stops the worker and releases the connection.
    rows: Option<mpsc::Receiver<Result<Row, SqlDispatchError>>>,
}

#[async_trait]
impl RowIterator for SqliteRows {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn header(&self) -> Result<Header, SqlDispatchError> {
        Ok(self.header.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SqlDispatchError> {
        let Some(rx) = self.rows.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => {
                self.rows = None;
                Err(err)
            }
            None => {
                self.rows = None;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.rows = None;
    }
}
