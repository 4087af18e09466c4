//! Convenient imports for common functionality.
//!
//! This module re-exports the types needed to open a connection, run calls and read their
//! results.

pub use crate::adapters::{AdapterRegistry, Querier, SharedQuerier};
pub use crate::call::{Call, CallDetails, CallId, CallObserver, CallState};
pub use crate::config::CallOptions;
pub use crate::connection::{Connection, ConnectionParams};
pub use crate::error::SqlDispatchError;
pub use crate::results::{CacheStatus, ResultCache, RowIterator, VecRowIterator};
pub use crate::schema::{Column, Schema, Structure, StructureType, TableOptions};
pub use crate::types::{AdapterKind, Header, Meta, Row, RowValues};

#[cfg(feature = "postgres")]
pub use crate::adapters::postgres::PostgresAdapter;
#[cfg(feature = "sqlite")]
pub use crate::adapters::sqlite::SqliteAdapter;
