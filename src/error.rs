use thiserror::Error;

/// Every failure the crate reports, from configuration through iteration.
#[derive(Debug, Error)]
pub enum SqlDispatchError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PoolErrorPostgres(#[from] deadpool_postgres::PoolError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Iteration error: {0}")]
    IterationError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Other database error: {0}")]
    Other(String),
}
