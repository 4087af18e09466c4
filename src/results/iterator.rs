use async_trait::async_trait;

use crate::error::SqlDispatchError;
use crate::types::{Header, Meta, Row};

/// Pull-based cursor over one query's result rows.
///
/// `next_row` returns `Ok(None)` once the stream is exhausted and keeps
/// returning it on every later call. `close` releases backend resources; it
/// may be called more than once and before exhaustion.
#[async_trait]
pub trait RowIterator: Send {
    fn meta(&self) -> &Meta;

    /// Column names for the result.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::QueryError` if the backend could not describe the columns.
    fn header(&self) -> Result<Header, SqlDispatchError>;

    /// Fetch the next row.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::IterationError` if the backend fails mid-stream.
    async fn next_row(&mut self) -> Result<Option<Row>, SqlDispatchError>;

    async fn close(&mut self);
}

/// Iterator over rows that are already in memory.
#[derive(Debug, Clone)]
pub struct VecRowIterator {
    meta: Meta,
    header: Header,
    rows: std::vec::IntoIter<Row>,
    closed: bool,
}

impl VecRowIterator {
    #[must_use]
    pub fn new(meta: Meta, header: Header, rows: Vec<Row>) -> Self {
        Self {
            meta,
            header,
            rows: rows.into_iter(),
            closed: false,
        }
    }
}

#[async_trait]
impl RowIterator for VecRowIterator {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn header(&self) -> Result<Header, SqlDispatchError> {
        Ok(self.header.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SqlDispatchError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
