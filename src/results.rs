//! Row iteration and result caching.
//!
//! - iterator: the pull-based cursor every adapter hands back
//! - cache: pageable buffer built by draining a cursor

pub mod cache;
pub mod iterator;

pub use cache::{CacheStatus, ResultCache};
pub use iterator::{RowIterator, VecRowIterator};
