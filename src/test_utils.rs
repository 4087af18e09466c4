//! Embedded `PostgreSQL` for integration tests.

use postgresql_embedded::PostgreSQL;
use tracing::info;

use crate::connection::ConnectionParams;

/// A running embedded `PostgreSQL` instance with one test database.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    pub database_url: String,
}

impl EmbeddedPostgres {
    /// Connection parameters pointing at the test database.
    #[must_use]
    pub fn params(&self, id: &str) -> ConnectionParams {
        ConnectionParams::new(id, "embedded", "postgres", self.database_url.clone())
    }
}

/// Install, start and provision an embedded server with database `db_name`.
///
/// # Errors
/// Returns an error if the server cannot be set up or started, or the database cannot be
/// created.
pub async fn setup_postgres_embedded(
    db_name: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    let mut postgresql = PostgreSQL::default();
    postgresql.setup().await?;
    postgresql.start().await?;
    postgresql.create_database(db_name).await?;

    let settings = postgresql.settings();
    let port = settings.port;
    let database_url = format!(
        "postgres://{}:{}@{}:{port}/{db_name}",
        settings.username, settings.password, settings.host
    );
    info!(port, "embedded postgres started");

    Ok(EmbeddedPostgres {
        postgresql,
        port,
        database_url,
    })
}

/// Stop a server started by [`setup_postgres_embedded`].
pub async fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    let EmbeddedPostgres { postgresql, .. } = postgres;
    let _ = postgresql.stop().await;
}
