use std::error::Error;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Config as PgConfig, NoTls, RowStream, Statement};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ColumnsQuery, DatabaseSwitcher, Querier, SchemaQuery, StructureQuery};
use crate::error::SqlDispatchError;
use crate::results::RowIterator;
use crate::schema::{TableOptions, quote_literal};
use crate::types::{Header, Meta, Row, RowValues};

const POOL_SIZE: usize = 4;

/// `PostgreSQL` adapter backed by a `deadpool-postgres` pool.
///
/// Each query checks out its own client and keeps it until the rows are drained or the
/// iterator is closed, so queries may run concurrently.
pub struct PostgresAdapter {
    config: RwLock<PgConfig>,
    pool: RwLock<Pool>,
}

impl PostgresAdapter {
    /// Build an adapter for a `postgres://` URL or a libpq-style key/value string.
    ///
    /// No connection is made until the first query.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` if the URL cannot be parsed or the pool cannot
    /// be created.
    pub fn open(url: &str) -> Result<Self, SqlDispatchError> {
        let config = PgConfig::from_str(url).map_err(|e| {
            SqlDispatchError::ConfigError(format!("invalid postgres connection string: {e}"))
        })?;
        let pool = build_pool(config.clone())?;
        Ok(Self {
            config: RwLock::new(config),
            pool: RwLock::new(pool),
        })
    }

    fn pool(&self) -> Result<Pool, SqlDispatchError> {
        self.pool
            .read()
            .map(|pool| pool.clone())
            .map_err(|_| SqlDispatchError::Other("postgres pool lock poisoned".into()))
    }

    async fn client(&self) -> Result<Object, SqlDispatchError> {
        self.pool()?
            .get()
            .await
            .map_err(|e| SqlDispatchError::ConnectionError(format!("postgres pool error: {e}")))
    }
}

fn build_pool(config: PgConfig) -> Result<Pool, SqlDispatchError> {
    let manager = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(POOL_SIZE)
        .build()
        .map_err(|e| {
            SqlDispatchError::ConfigError(format!("Failed to create Postgres pool: {e}"))
        })
}

fn query_error(err: &tokio_postgres::Error) -> SqlDispatchError {
    // The database error carries the server's message; the outer Display only says "db error".
    match err.as_db_error() {
        Some(db) => SqlDispatchError::QueryError(db.message().to_string()),
        None if err.is_closed() => SqlDispatchError::ConnectionError(err.to_string()),
        None => SqlDispatchError::QueryError(err.to_string()),
    }
}

/// Client checked out for a statement that has not returned yet.
///
/// If the query future is dropped first, the server is asked to cancel the statement and the
/// client is detached from the pool instead of being reused mid-statement.
struct InFlight(Option<Object>);

impl InFlight {
    fn client(&self) -> Result<&Object, SqlDispatchError> {
        self.0
            .as_ref()
            .ok_or_else(|| SqlDispatchError::Other("postgres client already released".into()))
    }

    fn finish(&mut self) -> Result<Object, SqlDispatchError> {
        self.0
            .take()
            .ok_or_else(|| SqlDispatchError::Other("postgres client already released".into()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(client) = self.0.take() else {
            return;
        };
        let token = client.cancel_token();
        drop(Object::take(client));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!("abandoned postgres statement; sending cancel request");
            handle.spawn(async move {
                if let Err(e) = token.cancel_query(NoTls).await {
                    warn!(error = %e, "postgres cancel request failed");
                }
            });
        }
    }
}

#[async_trait]
impl Querier for PostgresAdapter {
    async fn query(&self, query: &str) -> Result<Box<dyn RowIterator>, SqlDispatchError> {
        let meta = Meta::new(query);
        let mut in_flight = InFlight(Some(self.client().await?));
        let client = in_flight.client()?;
        let prepared = client.prepare(query).await;
        let stmt = match prepared {
            Ok(stmt) => stmt,
            Err(e) => {
                // Nothing is running on the server, so the client can go back to the pool.
                drop(in_flight.finish()?);
                return Err(query_error(&e));
            }
        };
        let header: Header = stmt
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();
        let started = client.query_raw(&stmt, Vec::<String>::new()).await;
        let client = in_flight.finish()?;
        let stream = started.map_err(|e| query_error(&e))?;

        Ok(Box::new(PostgresRows {
            meta,
            header,
            stream: Some(Box::pin(stream)),
            statement: Some(stmt),
            client: Some(client),
        }))
    }

    async fn close(&self) {
        match self.pool.read() {
            Ok(pool) => pool.close(),
            Err(_) => warn!("postgres pool lock poisoned while closing"),
        }
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

impl SchemaQuery for PostgresAdapter {
    fn schema_query(&self) -> String {
        "SELECT table_schema::text, table_name::text FROM information_schema.tables \
         UNION ALL \
         SELECT schemaname::text, matviewname::text FROM pg_matviews"
            .to_string()
    }
}

impl StructureQuery for PostgresAdapter {
    fn structure_query(&self) -> String {
        "SELECT table_schema::text, table_name::text, \
                CASE table_type WHEN 'VIEW' THEN 'view' ELSE 'table' END \
           FROM information_schema.tables \
         UNION ALL \
         SELECT schemaname::text, matviewname::text, 'materialized view' FROM pg_matviews \
         ORDER BY 1, 3, 2"
            .to_string()
    }
}

impl ColumnsQuery for PostgresAdapter {
    fn columns_query(&self, opts: &TableOptions) -> String {
        let schema = if opts.schema.is_empty() {
            "public"
        } else {
            opts.schema.as_str()
        };
        // pg_attribute also covers materialized views, which information_schema omits.
        format!(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
               FROM pg_attribute a \
               JOIN pg_class c ON a.attrelid = c.oid \
               JOIN pg_namespace n ON c.relnamespace = n.oid \
              WHERE n.nspname = {} AND c.relname = {} AND a.attnum > 0 AND NOT a.attisdropped \
              ORDER BY a.attnum",
            quote_literal(schema),
            quote_literal(&opts.table)
        )
    }
}

#[async_trait]
impl DatabaseSwitcher for PostgresAdapter {
    async fn select_database(&self, name: &str) -> Result<(), SqlDispatchError> {
        let mut config = self
            .config
            .read()
            .map_err(|_| SqlDispatchError::Other("postgres config lock poisoned".into()))?
            .clone();
        config.dbname(name);
        let pool = build_pool(config.clone())?;
        // Fail before swapping if the database does not exist.
        drop(pool.get().await.map_err(|e| {
            SqlDispatchError::ConnectionError(format!("cannot switch to database {name}: {e}"))
        })?);

        let old = {
            let mut guard = self
                .pool
                .write()
                .map_err(|_| SqlDispatchError::Other("postgres pool lock poisoned".into()))?;
            std::mem::replace(&mut *guard, pool)
        };
        old.close();
        if let Ok(mut guard) = self.config.write() {
            *guard = config;
        }
        debug!(database = name, "switched postgres database");
        Ok(())
    }

    async fn list_databases(&self) -> Result<(String, Vec<String>), SqlDispatchError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT current_database()::text, datname::text FROM pg_database \
                 WHERE datistemplate = false ORDER BY datname",
                &[],
            )
            .await
            .map_err(|e| query_error(&e))?;
        let mut current = String::new();
        let mut others = Vec::with_capacity(rows.len());
        for row in rows {
            current = row.try_get(0)?;
            let name: String = row.try_get(1)?;
            if name != current {
                others.push(name);
            }
        }
        Ok((current, others))
    }
}

struct PostgresRows {
    meta: Meta,
    header: Header,
    stream: Option<Pin<Box<RowStream>>>,
    // The statement must outlive the portal it feeds.
    statement: Option<Statement>,
    client: Option<Object>,
}

impl PostgresRows {
    fn release(&mut self) {
        self.stream = None;
        self.statement = None;
        self.client = None;
    }
}

#[async_trait]
impl RowIterator for PostgresRows {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn header(&self) -> Result<Header, SqlDispatchError> {
        Ok(self.header.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Row>, SqlDispatchError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next().await {
            Some(Ok(row)) => {
                let values = (0..row.len())
                    .map(|idx| extract_value(&row, idx))
                    .collect::<Result<Row, _>>()?;
                Ok(Some(values))
            }
            Some(Err(err)) => {
                self.release();
                Err(SqlDispatchError::IterationError(
                    err.as_db_error()
                        .map_or_else(|| err.to_string(), |db| db.message().to_string()),
                ))
            }
            None => {
                self.release();
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Some(client) = self.client.take() {
            let token = client.cancel_token();
            if let Err(err) = token.cancel_query(NoTls).await {
                debug!(error = %err, "postgres cancel request failed");
            }
            // The cancel targets the backend, not the statement, and may land on whatever
            // runs there next; this client is never reused.
            drop(Object::take(client));
        }
        self.release();
    }
}

/// Accepts any column type and keeps its raw bytes.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// `numeric` rendered the way the server prints it, without losing precision.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let word = |idx: usize| {
            raw.get(idx * 2..idx * 2 + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or("numeric value is truncated")
        };
        let ndigits = usize::from(word(0)?);
        let weight = i32::from(i16::from_be_bytes(word(1)?.to_be_bytes()));
        let sign = word(2)?;
        let dscale = usize::from(word(3)?);
        let digits = (0..ndigits)
            .map(|idx| word(4 + idx))
            .collect::<Result<Vec<u16>, _>>()?;

        match sign {
            NUMERIC_NAN => return Ok(NumericText("NaN".into())),
            NUMERIC_PINF => return Ok(NumericText("Infinity".into())),
            NUMERIC_NINF => return Ok(NumericText("-Infinity".into())),
            _ => {}
        }

        // Base-10000 digit at `pos` groups after the first; zero outside the stored range.
        let digit = |pos: i32| {
            usize::try_from(pos)
                .ok()
                .and_then(|pos| digits.get(pos))
                .copied()
                .unwrap_or(0)
        };
        let mut text = String::new();
        if sign == NUMERIC_NEG {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            text.push_str(&digit(0).to_string());
            for pos in 1..=weight {
                text.push_str(&format!("{:04}", digit(pos)));
            }
        }
        if dscale > 0 {
            let mut fraction = String::with_capacity(dscale + 4);
            let mut pos = weight + 1;
            while fraction.len() < dscale {
                fraction.push_str(&format!("{:04}", digit(pos)));
                pos += 1;
            }
            fraction.truncate(dscale);
            text.push('.');
            text.push_str(&fraction);
        }
        Ok(NumericText(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn iteration_error(err: &tokio_postgres::Error) -> SqlDispatchError {
    SqlDispatchError::IterationError(err.to_string())
}

fn text_of<T: ToString>(value: Option<T>) -> RowValues {
    value.map_or(RowValues::Null, |v| RowValues::Text(v.to_string()))
}

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
fn extract_value(row: &tokio_postgres::Row, idx: usize) -> Result<RowValues, SqlDispatchError> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map_or(RowValues::Null, |i| RowValues::Int(i64::from(i)))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map_or(RowValues::Null, |i| RowValues::Int(i64::from(i)))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Int)),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .map(|v| v.map_or(RowValues::Null, |i| RowValues::Int(i64::from(i)))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map_or(RowValues::Null, |f| RowValues::Float(f64::from(f)))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Float)),
        Type::NUMERIC => row
            .try_get::<_, Option<NumericText>>(idx)
            .map(|v| v.map_or(RowValues::Null, |n| RowValues::Text(n.0))),
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Bool)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Timestamp)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map_or(RowValues::Null, |dt| RowValues::Timestamp(dt.naive_utc()))),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx).map(text_of),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx).map(text_of),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx).map(text_of),
        Type::INET => row.try_get::<_, Option<IpAddr>>(idx).map(text_of),
        Type::CHAR => row
            .try_get::<_, Option<i8>>(idx)
            .map(|v| text_of(v.map(|c| char::from(c.to_ne_bytes()[0])))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::JSON)),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Blob)),
        ref text if <String as FromSql<'_>>::accepts(text) => row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map_or(RowValues::Null, RowValues::Text)),
        // Enums and xml are sent as their text; the bytes decode as-is.
        ref texty if matches!(texty.kind(), Kind::Enum(_)) || *texty == Type::XML => row
            .try_get::<_, Option<RawValue>>(idx)
            .map(|v| v.map_or(RowValues::Null, |raw| RowValues::Blob(raw.0).normalize_text())),
        // Everything else keeps its binary wire form.
        _ => row
            .try_get::<_, Option<RawValue>>(idx)
            .map(|v| v.map_or(RowValues::Null, |raw| RowValues::Blob(raw.0))),
    };
    value.map_err(|e| iteration_error(&e))
}
