use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::error::SqlDispatchError;
use crate::results::iterator::RowIterator;
use crate::types::{Header, Meta, Row};

const DRAIN_CHUNK: usize = 1024;

/// Snapshot of how far a cache has drained its iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    /// Rows pulled from the iterator so far.
    pub buffered: usize,
    /// The iterator reported end-of-stream.
    pub exhausted: bool,
    /// The cache was closed before exhaustion.
    pub closed: bool,
}

/// Pageable buffer over a [`RowIterator`].
///
/// Rows are pulled from the iterator only as far as a request needs them and
/// kept in memory, so the same range can be read any number of times and in
/// any order. All access goes through one async mutex; the call that fills the
/// cache and a caller reading pages can share it freely.
pub struct ResultCache {
    meta: Meta,
    header: Header,
    inner: Mutex<CacheInner>,
    // Flips to true once the iterator and permit have been let go.
    released: watch::Sender<bool>,
}

struct CacheInner {
    // None once the iterator has been closed.
    iter: Option<Box<dyn RowIterator>>,
    rows: Vec<Row>,
    exhausted: bool,
    closed: bool,
    // Held while the iterator is live for adapters that need serialized access.
    permit: Option<OwnedMutexGuard<()>>,
}

impl ResultCache {
    /// Wrap an iterator.
    ///
    /// # Errors
    /// Returns the iterator's header error if the column names are unavailable; the iterator is
    /// closed before returning.
    pub async fn new(
        mut iter: Box<dyn RowIterator>,
        permit: Option<OwnedMutexGuard<()>>,
    ) -> Result<Self, SqlDispatchError> {
        let header = match iter.header() {
            Ok(header) => header,
            Err(err) => {
                iter.close().await;
                return Err(err);
            }
        };
        let meta = iter.meta().clone();
        Ok(Self {
            meta,
            header,
            inner: Mutex::new(CacheInner {
                iter: Some(iter),
                rows: Vec::new(),
                exhausted: false,
                closed: false,
                permit,
            }),
            released: watch::Sender::new(false),
        })
    }

    /// Replace the metadata reported by the iterator.
    #[must_use]
    pub(crate) fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Pull up to `count` more rows from the iterator.
    ///
    /// Returns how many rows were added; zero once the iterator is exhausted or closed.
    ///
    /// # Errors
    /// Propagates the iterator's error, or `IterationError` for a row whose width does not
    /// match the header.
    pub async fn pull(&self, count: usize) -> Result<usize, SqlDispatchError> {
        let mut inner = self.inner.lock().await;
        self.pull_locked(&mut inner, count).await
    }

    /// Rows in the half-open range `[from, to)`, truncated at the end of the result.
    ///
    /// # Errors
    /// Returns any error raised while pulling the missing part of the range.
    pub async fn rows(&self, from: usize, to: usize) -> Result<Vec<Row>, SqlDispatchError> {
        let mut inner = self.inner.lock().await;
        if to > inner.rows.len() {
            let missing = to - inner.rows.len();
            self.pull_locked(&mut inner, missing).await?;
        }
        let end = to.min(inner.rows.len());
        let start = from.min(end);
        Ok(inner.rows[start..end].to_vec())
    }

    /// Drain the iterator to the end and return every row.
    ///
    /// # Errors
    /// Returns any error raised while draining.
    pub async fn all_rows(&self) -> Result<Vec<Row>, SqlDispatchError> {
        let mut inner = self.inner.lock().await;
        while self.pull_locked(&mut inner, DRAIN_CHUNK).await? > 0 {}
        Ok(inner.rows.clone())
    }

    /// Pull every remaining row into memory, releasing the iterator.
    ///
    /// Returns the number of rows buffered afterwards.
    ///
    /// # Errors
    /// Returns any error raised while draining; the cache is closed in that case.
    pub async fn drain(&self) -> Result<usize, SqlDispatchError> {
        let mut inner = self.inner.lock().await;
        while self.pull_locked(&mut inner, DRAIN_CHUNK).await? > 0 {}
        Ok(inner.rows.len())
    }

    /// Resolve once the iterator and any permit it carried have been released.
    pub(crate) async fn released(&self) {
        let mut released = self.released.subscribe();
        // The sender lives as long as `self`.
        let _ = released.wait_for(|done| *done).await;
    }

    pub async fn status(&self) -> CacheStatus {
        let inner = self.inner.lock().await;
        CacheStatus {
            buffered: inner.rows.len(),
            exhausted: inner.exhausted,
            closed: inner.closed,
        }
    }

    /// Number of rows buffered so far.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.rows.is_empty()
    }

    pub async fn is_exhausted(&self) -> bool {
        self.inner.lock().await.exhausted
    }

    /// Close the wrapped iterator. Buffered rows stay readable.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.exhausted || inner.closed {
            return;
        }
        inner.closed = true;
        self.release(&mut inner).await;
    }

    async fn pull_locked(
        &self,
        inner: &mut CacheInner,
        count: usize,
    ) -> Result<usize, SqlDispatchError> {
        let mut added = 0;
        while added < count {
            let Some(iter) = inner.iter.as_mut() else {
                break;
            };
            let next = match iter.next_row().await {
                Ok(next) => next,
                Err(err) => {
                    self.abort(inner).await;
                    return Err(err);
                }
            };
            match next {
                Some(row) => {
                    if row.len() != self.header.len() {
                        let err = SqlDispatchError::IterationError(format!(
                            "row {} has {} values for {} columns",
                            inner.rows.len(),
                            row.len(),
                            self.header.len()
                        ));
                        self.abort(inner).await;
                        return Err(err);
                    }
                    inner.rows.push(row);
                    added += 1;
                }
                None => {
                    inner.exhausted = true;
                    self.release(inner).await;
                }
            }
        }
        Ok(added)
    }

    // A failed pull closes the cache; rows buffered before the failure stay readable.
    async fn abort(&self, inner: &mut CacheInner) {
        inner.closed = true;
        self.release(inner).await;
    }

    async fn release(&self, inner: &mut CacheInner) {
        if let Some(mut iter) = inner.iter.take() {
            iter.close().await;
        }
        inner.permit = None;
        self.released.send_replace(true);
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("query", &self.meta.query)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}
