use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Scalar values produced by a row iterator.
///
/// Adapters map every backend type onto one of these variants inside their
/// iterator, so callers never see driver-specific representations:
/// ```rust
/// use sql_dispatch::prelude::*;
///
/// let row: Row = vec![RowValues::Int(1), RowValues::Text("john_doe".into())];
/// assert_eq!(row[1].as_text(), Some("john_doe"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValues::Bool(value) => Some(*value),
            RowValues::Int(1) => Some(true),
            RowValues::Int(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            return Some(*value);
        } else if let Some(s) = self.as_text() {
            // Try "YYYY-MM-DD HH:MM:SS"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt);
            }
            // Try "YYYY-MM-DD HH:MM:SS.SSS"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S.%3f") {
                return Some(dt);
            }
        }
        None
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Turn byte buffers that hold UTF-8 text into `Text`.
    ///
    /// Drivers that cannot tell character data from binary data hand out
    /// bytes for both; their iterators call this on every value. Buffers that
    /// are not valid UTF-8 stay `Blob`.
    #[must_use]
    pub fn normalize_text(self) -> Self {
        match self {
            RowValues::Blob(bytes) => match String::from_utf8(bytes) {
                Ok(text) => RowValues::Text(text),
                Err(err) => RowValues::Blob(err.into_bytes()),
            },
            other => other,
        }
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_owned())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

/// One result row, values in header order.
pub type Row = Vec<RowValues>;

/// Column names of a result, one per row position.
pub type Header = Vec<String>;

/// Immutable facts about one query's result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Query text exactly as submitted.
    pub query: String,
    /// When execution began.
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The adapter kinds built into this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// `PostgreSQL` database
    #[cfg(feature = "postgres")]
    Postgres,
    /// `SQLite` database
    #[cfg(feature = "sqlite")]
    Sqlite,
}

impl AdapterKind {
    /// Registry tags this kind answers to; the first one is canonical.
    #[must_use]
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            #[cfg(feature = "postgres")]
            AdapterKind::Postgres => &["postgres", "postgresql", "pg"],
            #[cfg(feature = "sqlite")]
            AdapterKind::Sqlite => &["sqlite", "sqlite3"],
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tags()[0])
    }
}
