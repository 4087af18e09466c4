use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterRegistry, SharedQuerier};
use crate::call::{Call, CallContext, CallObserver, CallState, WeakCall};
use crate::config::CallOptions;
use crate::error::SqlDispatchError;
use crate::gate::Gate;
use crate::schema::{
    Column, Schema, Structure, TableOptions, fold_columns, fold_schema, fold_structure,
};
use crate::types::Row;

static ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));

/// Everything needed to build a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub id: String,
    pub name: String,
    /// Adapter type tag, e.g. `sqlite` or `postgres`.
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl ConnectionParams {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            url: url.into(),
        }
    }

    /// Replace every `${VAR}` in the URL with the value of the environment variable `VAR`.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` naming the first variable that is not set.
    pub fn expand(&self) -> Result<Self, SqlDispatchError> {
        let mut missing = None;
        let url = ENV_REFERENCE.replace_all(&self.url, |caps: &Captures<'_>| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => value,
                Err(_) => {
                    missing.get_or_insert_with(|| var.to_owned());
                    String::new()
                }
            }
        });
        if let Some(var) = missing {
            return Err(SqlDispatchError::ConfigError(format!(
                "environment variable {var} referenced by connection \"{}\" is not set",
                self.id
            )));
        }
        Ok(Self {
            url: url.into_owned(),
            ..self.clone()
        })
    }
}

/// A live connection: one adapter plus the calls issued through it.
pub struct Connection {
    params: ConnectionParams,
    adapter: SharedQuerier,
    // Present when the adapter cannot run two queries at once.
    gate: Option<Arc<Gate>>,
    options: CallOptions,
    // Also guards the transition to closed, so a call is either refused or seen by `close`.
    calls: StdMutex<Vec<WeakCall>>,
    closed: AtomicBool,
}

impl Connection {
    /// Build the adapter registered for `params.kind` and wrap it.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` for an unknown type tag or a URL the adapter
    /// cannot use.
    pub fn new(
        params: ConnectionParams,
        registry: &AdapterRegistry,
        options: CallOptions,
    ) -> Result<Self, SqlDispatchError> {
        let adapter = registry.build(&params)?;
        Ok(Self::with_adapter(params, adapter, options))
    }

    /// Wrap an adapter that was built elsewhere.
    #[must_use]
    pub fn with_adapter(
        params: ConnectionParams,
        adapter: SharedQuerier,
        options: CallOptions,
    ) -> Self {
        let gate = (!adapter.is_concurrency_safe()).then(|| Arc::new(Gate::new()));
        info!(
            connection = %params.id,
            kind = %params.kind,
            serialized = gate.is_some(),
            "connection opened"
        );
        Self {
            params,
            adapter,
            gate,
            options,
            calls: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.params.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.params.name
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.params.kind
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start running `query` in the background and return its handle immediately.
    ///
    /// The returned call is already `Executing`. `observer`, when given, sees every
    /// transition in order, starting with `Executing`.
    ///
    /// # Errors
    /// Returns `SqlDispatchError::ConfigError` if the connection is closed or there is no
    /// Tokio runtime to run the call on.
    pub fn execute(
        &self,
        query: impl Into<String>,
        observer: Option<CallObserver>,
    ) -> Result<Call, SqlDispatchError> {
        let runtime = Handle::try_current().map_err(|e| {
            SqlDispatchError::ConfigError(format!("execute needs a Tokio runtime: {e}"))
        })?;
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| SqlDispatchError::Other("call registry lock poisoned".into()))?;
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let ctx = CallContext {
            adapter: Arc::clone(&self.adapter),
            gate: self.gate.clone(),
            options: self.options,
        };
        let call = Call::spawn(query.into(), ctx, observer, &runtime);
        calls.retain(|weak| weak.upgrade().is_some());
        calls.push(call.downgrade());
        Ok(call)
    }

    /// Calls issued on this connection that have not reached a terminal state.
    #[must_use]
    pub fn live_calls(&self) -> Vec<Call> {
        self.tracked()
            .into_iter()
            .filter(|call| !call.state().is_terminal())
            .collect()
    }

    /// Every object grouped by schema.
    ///
    /// # Errors
    /// `Unsupported` when the adapter has no schema query, `SchemaError` when it fails.
    pub async fn schema(&self) -> Result<Schema, SqlDispatchError> {
        let query = self
            .adapter
            .as_schema()
            .ok_or_else(|| self.unsupported("schema listing"))?
            .schema_query();
        let rows = self.run_introspection(query).await?;
        fold_schema(&rows)
    }

    /// Columns of one table or view, in declaration order.
    ///
    /// # Errors
    /// `Unsupported` when the adapter cannot describe columns, `SchemaError` when the object
    /// does not exist or the lookup fails.
    pub async fn get_columns(&self, opts: &TableOptions) -> Result<Vec<Column>, SqlDispatchError> {
        let query = self
            .adapter
            .as_columns()
            .ok_or_else(|| self.unsupported("column listing"))?
            .columns_query(opts);
        let rows = self.run_introspection(query).await?;
        let columns = fold_columns(&rows)?;
        if columns.is_empty() {
            return Err(SqlDispatchError::SchemaError(format!(
                "no columns found for {}.{}",
                opts.schema, opts.table
            )));
        }
        Ok(columns)
    }

    /// The catalog as a schema -> object tree.
    ///
    /// # Errors
    /// `Unsupported` when the adapter has no structure query, `SchemaError` when it fails.
    pub async fn get_structure(&self) -> Result<Vec<Structure>, SqlDispatchError> {
        let query = self
            .adapter
            .as_structure()
            .ok_or_else(|| self.unsupported("structure listing"))?
            .structure_query();
        let rows = self.run_introspection(query).await?;
        fold_structure(&rows)
    }

    /// Point the connection at another database.
    ///
    /// # Errors
    /// `Unsupported` when the adapter cannot switch databases, otherwise the adapter's error.
    pub async fn select_database(&self, name: &str) -> Result<(), SqlDispatchError> {
        let switcher = self
            .adapter
            .as_database_switcher()
            .ok_or_else(|| self.unsupported("database switching"))?;
        debug!(connection = %self.params.id, database = name, "selecting database");
        let _permit = self.serialize().await;
        switcher.select_database(name).await
    }

    /// The current database and the others available.
    ///
    /// # Errors
    /// `Unsupported` when the adapter cannot switch databases, otherwise the adapter's error.
    pub async fn list_databases(&self) -> Result<(String, Vec<String>), SqlDispatchError> {
        let switcher = self
            .adapter
            .as_database_switcher()
            .ok_or_else(|| self.unsupported("database listing"))?;
        let _permit = self.serialize().await;
        switcher.list_databases().await
    }

    /// Cancel every live call, release their results and close the adapter.
    ///
    /// Calling it again does nothing.
    pub async fn close(&self) {
        let calls = {
            let Ok(tracked) = self.calls.lock() else {
                warn!(connection = %self.params.id, "call registry lock poisoned while closing");
                return;
            };
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            tracked.iter().filter_map(WeakCall::upgrade).collect::<Vec<_>>()
        };
        info!(
            connection = %self.params.id,
            calls = calls.len(),
            "closing connection"
        );
        for call in &calls {
            call.cancel();
        }
        for call in &calls {
            call.wait().await;
            if let Some(cache) = call.result() {
                cache.close().await;
            }
        }
        self.adapter.close().await;
    }

    async fn run_introspection(&self, query: String) -> Result<Vec<Row>, SqlDispatchError> {
        let call = self.execute(query, None)?;
        let guard = CancelOnDrop(call.clone());
        let state = call.wait().await;
        let rows = match (state, call.result()) {
            (CallState::Archived, Some(cache)) => cache
                .all_rows()
                .await
                .map_err(|e| SqlDispatchError::SchemaError(e.to_string()))?,
            (CallState::Canceled, _) => {
                return Err(SqlDispatchError::SchemaError(
                    "introspection query was canceled".to_owned(),
                ));
            }
            _ => {
                let reason = call
                    .err()
                    .map_or_else(|| format!("call ended as {state}"), |e| e.to_string());
                warn!(connection = %self.params.id, error = %reason, "introspection failed");
                return Err(SqlDispatchError::SchemaError(reason));
            }
        };
        drop(guard);
        Ok(rows)
    }

    // Adapter work outside a call still waits its turn on serialized adapters.
    async fn serialize(&self) -> Option<OwnedMutexGuard<()>> {
        match self.gate.as_deref() {
            Some(gate) => Some(gate.acquire().await),
            None => None,
        }
    }

    fn closed_error(&self) -> SqlDispatchError {
        SqlDispatchError::ConfigError(format!("connection \"{}\" is closed", self.params.id))
    }

    fn tracked(&self) -> Vec<Call> {
        match self.calls.lock() {
            Ok(calls) => calls.iter().filter_map(WeakCall::upgrade).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn unsupported(&self, what: &str) -> SqlDispatchError {
        SqlDispatchError::Unsupported(format!(
            "{what} is not supported by \"{}\" connections",
            self.params.kind
        ))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("params", &self.params)
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// Abandoned introspection must not leave its call running.
struct CancelOnDrop(Call);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
