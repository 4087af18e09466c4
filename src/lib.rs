//! Asynchronous query dispatch over pluggable SQL backends.
//!
//! A [`Connection`] owns one adapter. [`Connection::execute`] returns a [`Call`] immediately
//! and runs the query on a background task; the call moves through
//! `Executing -> Retrieving -> Archived` (or one of the failure/cancel states) and buffers
//! rows in a [`ResultCache`] that can be paged while it is still filling.
//!
//! ```rust,no_run
//! use sql_dispatch::prelude::*;
//!
//! # async fn run() -> Result<(), SqlDispatchError> {
//! let registry = AdapterRegistry::with_defaults();
//! let params = ConnectionParams::new("local", "scratch", "sqlite", "sqlite://scratch.db");
//! let conn = Connection::new(params, &registry, CallOptions::default())?;
//!
//! let call = conn.execute("SELECT 1", None)?;
//! if call.wait().await == CallState::Archived {
//!     let rows = call.result().expect("archived calls have results").all_rows().await?;
//!     println!("{rows:?}");
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod call;
pub mod config;
pub mod connection;
pub mod error;
mod gate;
pub mod prelude;
pub mod results;
pub mod schema;
#[cfg(feature = "test-utils-postgres")]
pub mod test_utils;
pub mod types;

pub use adapters::{
    AdapterRegistry, ColumnsQuery, DatabaseSwitcher, Querier, SchemaQuery, SharedQuerier,
    StructureQuery,
};
pub use call::{Call, CallDetails, CallId, CallObserver, CallState};
pub use config::CallOptions;
pub use connection::{Connection, ConnectionParams};
pub use error::SqlDispatchError;
pub use results::{CacheStatus, ResultCache, RowIterator, VecRowIterator};
pub use schema::{Column, Schema, Structure, StructureType, TableOptions};
pub use types::{AdapterKind, Header, Meta, Row, RowValues};
