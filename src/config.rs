use serde::{Deserialize, Serialize};

/// Rows pulled per lock acquisition while a call fills its cache.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Rows a call buffers before it reports `Archived` and leaves the rest to paging.
pub const DEFAULT_PREFETCH_ROWS: usize = 10_000;

/// How calls issued by a connection drain their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    pub chunk_size: usize,
    /// `None` drains every result to the end before archiving.
    pub prefetch_rows: Option<usize>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefetch_rows: Some(DEFAULT_PREFETCH_ROWS),
        }
    }
}

impl CallOptions {
    #[must_use]
    pub fn builder() -> CallOptionsBuilder {
        CallOptionsBuilder::default()
    }
}

/// Fluent builder for [`CallOptions`].
#[derive(Debug, Clone, Default)]
pub struct CallOptionsBuilder {
    opts: CallOptions,
}

impl CallOptionsBuilder {
    /// Values below one are raised to one.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.opts.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn prefetch_rows(mut self, prefetch_rows: usize) -> Self {
        self.opts.prefetch_rows = Some(prefetch_rows);
        self
    }

    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.opts.prefetch_rows = None;
        self
    }

    #[must_use]
    pub fn finish(self) -> CallOptions {
        self.opts
    }
}
