use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::SharedQuerier;
use crate::connection::ConnectionParams;
use crate::error::SqlDispatchError;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
use crate::types::AdapterKind;

/// Builds an adapter from connection parameters.
pub type AdapterConstructor =
    Arc<dyn Fn(&ConnectionParams) -> Result<SharedQuerier, SqlDispatchError> + Send + Sync>;

/// Maps adapter type tags to constructors.
///
/// Built once at startup and handed to whatever creates connections:
/// ```rust
/// use sql_dispatch::prelude::*;
///
/// let registry = AdapterRegistry::with_defaults();
/// assert!(registry.contains("sqlite"));
/// assert!(!registry.contains("oracle"));
/// ```
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl AdapterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every adapter compiled into this build.
    #[must_use]
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "sqlite")]
        for tag in AdapterKind::Sqlite.tags() {
            registry.register(tag, |params: &ConnectionParams| {
                let adapter = super::sqlite::SqliteAdapter::open(&params.url)?;
                Ok(Arc::new(adapter) as SharedQuerier)
            });
        }
        #[cfg(feature = "postgres")]
        for tag in AdapterKind::Postgres.tags() {
            registry.register(tag, |params: &ConnectionParams| {
                let adapter = super::postgres::PostgresAdapter::open(&params.url)?;
                Ok(Arc::new(adapter) as SharedQuerier)
            });
        }
        registry
    }

    /// Register `constructor` under `tag`, replacing any previous entry. Tags are case-insensitive.
    pub fn register<F>(&mut self, tag: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ConnectionParams) -> Result<SharedQuerier, SqlDispatchError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(tag.to_ascii_lowercase(), Arc::new(constructor));
        self
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(&tag.to_ascii_lowercase())
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.constructors.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Construct the adapter for `params.kind`.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` if no constructor is registered for the tag, or
    /// whatever configuration error the constructor reports.
    pub fn build(&self, params: &ConnectionParams) -> Result<SharedQuerier, SqlDispatchError> {
        let tag = params.kind.to_ascii_lowercase();
        let constructor = self.constructors.get(&tag).ok_or_else(|| {
            SqlDispatchError::ConfigError(format!(
                "no adapter registered for type \"{}\"",
                params.kind
            ))
        })?;
        debug!(connection = %params.id, kind = %tag, "building adapter");
        constructor(params)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
