//! One query execution and its lifecycle.
//!
//! A [`Call`] is driven by a single background task which is the only writer of its state.
//! Every transition is queued to a second task that hands it to the caller's observer, so a
//! slow observer never stalls draining and notifications always arrive in transition order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::SharedQuerier;
use crate::config::CallOptions;
use crate::error::SqlDispatchError;
use crate::gate::Gate;
use crate::results::ResultCache;
use crate::types::Meta;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique call identifier.
pub type CallId = u64;

/// Callback invoked once per state transition, in order.
pub type CallObserver = Arc<dyn Fn(CallState, &Call) + Send + Sync>;

/// Lifecycle of a call.
///
/// ```text
/// Unknown -> Executing -> Retrieving -> Archived
///                |            |-------> RetrievingFailed
///                |            '-------> Canceled
///                |------> ExecutingFailed
///                '------> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Unknown,
    Executing,
    ExecutingFailed,
    Retrieving,
    RetrievingFailed,
    Archived,
    Canceled,
}

impl CallState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExecutingFailed | Self::RetrievingFailed | Self::Archived | Self::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::{
            Archived, Canceled, Executing, ExecutingFailed, Retrieving, RetrievingFailed, Unknown,
        };
        matches!(
            (self, next),
            (Unknown, Executing)
                | (Executing, ExecutingFailed | Retrieving | Canceled)
                | (Retrieving, RetrievingFailed | Archived | Canceled)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Executing => "executing",
            Self::ExecutingFailed => "executing_failed",
            Self::Retrieving => "retrieving",
            Self::RetrievingFailed => "retrieving_failed",
            Self::Archived => "archived",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable snapshot of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDetails {
    pub id: CallId,
    pub query: String,
    pub state: CallState,
    pub error: Option<String>,
    pub time_taken_ms: Option<u64>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Handle to one query execution.
///
/// Cloning is cheap; every clone observes the same call.
#[derive(Clone)]
pub struct Call {
    shared: Arc<CallShared>,
}

struct CallShared {
    id: CallId,
    meta: Meta,
    started: Instant,
    state: watch::Sender<CallState>,
    // Flips to true once the terminal state has been handed to the observer.
    delivered: watch::Sender<bool>,
    error: OnceLock<Arc<SqlDispatchError>>,
    cache: OnceLock<Arc<ResultCache>>,
    elapsed: OnceLock<Duration>,
    cancel: CancellationToken,
}

/// Weak reference kept by the owning connection.
#[derive(Clone)]
pub(crate) struct WeakCall(Weak<CallShared>);

impl WeakCall {
    pub(crate) fn upgrade(&self) -> Option<Call> {
        self.0.upgrade().map(|shared| Call { shared })
    }
}

/// Everything the worker needs besides the call itself.
pub(crate) struct CallContext {
    pub(crate) adapter: SharedQuerier,
    pub(crate) gate: Option<Arc<Gate>>,
    pub(crate) options: CallOptions,
}

impl Call {
    /// Create a call, move it to `Executing` and start its worker on `runtime`.
    pub(crate) fn spawn(
        query: String,
        ctx: CallContext,
        observer: Option<CallObserver>,
        runtime: &Handle,
    ) -> Call {
        let call = Call {
            shared: Arc::new(CallShared {
                id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
                meta: Meta::new(query),
                started: Instant::now(),
                state: watch::Sender::new(CallState::Unknown),
                delivered: watch::Sender::new(false),
                error: OnceLock::new(),
                cache: OnceLock::new(),
                elapsed: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        };

        let (events, queue) = mpsc::unbounded_channel();
        runtime.spawn(deliver(call.clone(), queue, observer));

        let worker = Worker { call: call.clone(), events };
        worker.transition(CallState::Executing);
        debug!(call_id = call.id(), query = %call.query(), "call started");
        runtime.spawn(worker.run(ctx));
        call
    }

    pub(crate) fn downgrade(&self) -> WeakCall {
        WeakCall(Arc::downgrade(&self.shared))
    }

    #[must_use]
    pub fn id(&self) -> CallId {
        self.shared.id
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.shared.meta.query
    }

    /// Query text and the moment the call was issued.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.shared.meta
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        *self.shared.state.borrow()
    }

    /// The error that ended the call, for `ExecutingFailed` and `RetrievingFailed`.
    #[must_use]
    pub fn err(&self) -> Option<Arc<SqlDispatchError>> {
        self.shared.error.get().cloned()
    }

    /// The result cache, available from `Retrieving` on.
    #[must_use]
    pub fn result(&self) -> Option<Arc<ResultCache>> {
        self.shared.cache.get().cloned()
    }

    /// Time from issue to the terminal state, once reached.
    #[must_use]
    pub fn time_taken(&self) -> Option<Duration> {
        self.shared.elapsed.get().copied()
    }

    /// Watch the current state. Intermediate states may be skipped by a slow reader; use an
    /// observer to see every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Wait until the call is terminal and its observer has been told.
    pub async fn wait(&self) -> CallState {
        let mut delivered = self.shared.delivered.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = delivered.wait_for(|done| *done).await;
        self.state()
    }

    /// Request cancellation. A no-op once the call is terminal.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        debug!(call_id = self.id(), "cancel requested");
        self.shared.cancel.cancel();
    }

    #[must_use]
    pub fn details(&self) -> CallDetails {
        CallDetails {
            id: self.id(),
            query: self.query().to_owned(),
            state: self.state(),
            error: self.err().map(|e| e.to_string()),
            time_taken_ms: self
                .time_taken()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            timestamp: self.shared.meta.timestamp,
        }
    }

    fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id())
            .field("query", &self.query())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn deliver(
    call: Call,
    mut queue: mpsc::UnboundedReceiver<CallState>,
    observer: Option<CallObserver>,
) {
    while let Some(state) = queue.recv().await {
        if let Some(observer) = observer.as_ref() {
            observer(state, &call);
        }
        if state.is_terminal() {
            break;
        }
    }
    call.shared.delivered.send_replace(true);
}

struct Worker {
    call: Call,
    events: mpsc::UnboundedSender<CallState>,
}

impl Worker {
    fn transition(&self, next: CallState) {
        let shared = &self.call.shared;
        let prev = *shared.state.borrow();
        if !prev.can_transition_to(next) {
            warn!(call_id = shared.id, %prev, %next, "ignoring illegal call transition");
            return;
        }
        if next.is_terminal() {
            let _ = shared.elapsed.set(shared.started.elapsed());
        }
        shared.state.send_replace(next);
        debug!(call_id = shared.id, %prev, %next, "call state changed");
        let _ = self.events.send(next);
    }

    fn fail(&self, next: CallState, err: SqlDispatchError) {
        debug!(call_id = self.call.id(), error = %err, "call failed");
        let _ = self.call.shared.error.set(Arc::new(err));
        self.transition(next);
    }

    async fn run(self, ctx: CallContext) {
        let token = self.call.cancellation();
        let CallContext {
            adapter,
            gate,
            options,
        } = ctx;

        let permit = match gate.as_deref() {
            Some(gate) => tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.transition(CallState::Canceled);
                    return;
                }
                permit = gate.acquire() => Some(permit),
            },
            None => None,
        };

        let queried = tokio::select! {
            biased;
            () = token.cancelled() => {
                adapter.interrupt();
                self.transition(CallState::Canceled);
                return;
            }
            res = adapter.query(self.call.query()) => res,
        };
        let iter = match queried {
            Ok(iter) => iter,
            Err(err) => {
                self.fail(CallState::ExecutingFailed, err);
                return;
            }
        };

        let cache = match ResultCache::new(iter, permit).await {
            Ok(cache) => Arc::new(cache.with_meta(self.call.meta().clone())),
            Err(err) => {
                self.transition(CallState::Retrieving);
                self.fail(CallState::RetrievingFailed, err);
                return;
            }
        };
        let _ = self.call.shared.cache.set(Arc::clone(&cache));
        self.transition(CallState::Retrieving);

        loop {
            let mut want = options.chunk_size.max(1);
            if let Some(limit) = options.prefetch_rows {
                let buffered = cache.len().await;
                if buffered >= limit {
                    break;
                }
                want = want.min(limit - buffered);
            }

            let pulled = tokio::select! {
                biased;
                () = token.cancelled() => {
                    cache.close().await;
                    self.transition(CallState::Canceled);
                    return;
                }
                res = cache.pull(want) => res,
            };
            match pulled {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    cache.close().await;
                    self.fail(CallState::RetrievingFailed, err);
                    return;
                }
            }
        }

        self.transition(CallState::Archived);

        // Archived early with the permit still held: give it up once another call queues.
        if let Some(gate) = gate.as_deref() {
            tokio::select! {
                () = cache.released() => {}
                () = gate.contended() => {
                    debug!(call_id = self.call.id(), "draining result for a queued call");
                    if let Err(err) = cache.drain().await {
                        warn!(call_id = self.call.id(), error = %err, "draining result failed");
                    }
                }
            }
        }
    }
}
