// Adapter module - the contract every backend implements
//
// - Querier: mandatory "run this query, give me rows" capability
// - SchemaQuery / ColumnsQuery / StructureQuery / DatabaseSwitcher: optional capabilities
// - registry: type tag -> constructor lookup used when building connections
// - sqlite / postgres: the built-in backends

pub mod registry;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SqlDispatchError;
use crate::results::RowIterator;
use crate::schema::TableOptions;

pub use registry::{AdapterConstructor, AdapterRegistry};

/// Shared handle to an adapter; a connection owns exactly one.
pub type SharedQuerier = Arc<dyn Querier>;

/// Backend-specific query execution.
///
/// Optional capabilities are exposed through the `as_*` accessors; an adapter that lacks one
/// keeps the default `None` and the connection reports the operation as unsupported.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Run `query` and return a cursor over its rows.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConnectionError` when the backend is unreachable and
    /// `SqlDispatchError::QueryError` with the backend's message when it rejects the query.
    async fn query(&self, query: &str) -> Result<Box<dyn RowIterator>, SqlDispatchError>;

    /// Release every backend resource held by the adapter.
    async fn close(&self);

    /// Ask the backend to abandon whatever statement is running. Best effort.
    fn interrupt(&self) {}

    /// `false` when two queries must never run on the adapter at the same time.
    fn is_concurrency_safe(&self) -> bool {
        true
    }

    fn as_schema(&self) -> Option<&dyn SchemaQuery> {
        None
    }

    fn as_columns(&self) -> Option<&dyn ColumnsQuery> {
        None
    }

    fn as_structure(&self) -> Option<&dyn StructureQuery> {
        None
    }

    fn as_database_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        None
    }
}

/// Lists every object per schema.
pub trait SchemaQuery: Send + Sync {
    /// A query returning two text columns: schema name, object name.
    fn schema_query(&self) -> String;
}

/// Describes the columns of one object.
pub trait ColumnsQuery: Send + Sync {
    /// A query returning two text columns, column name and declared type, in declaration order.
    fn columns_query(&self, opts: &TableOptions) -> String;
}

/// Lists the catalog as a tree.
pub trait StructureQuery: Send + Sync {
    /// A query returning three text columns: schema, object name, object kind.
    fn structure_query(&self) -> String;
}

/// Switches between databases on the same server.
#[async_trait]
pub trait DatabaseSwitcher: Send + Sync {
    /// Point the adapter at another database.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConnectionError` if the new database cannot be reached.
    async fn select_database(&self, name: &str) -> Result<(), SqlDispatchError>;

    /// The current database and the ones available to switch to.
    ///
    /// # Errors
    /// Returns any backend error raised while listing.
    async fn list_databases(&self) -> Result<(String, Vec<String>), SqlDispatchError>;
}
