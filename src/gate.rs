use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Serializes access to an adapter that cannot run calls concurrently.
///
/// The permit travels with a call's result cache until the rows are exhausted or closed. A
/// holder with rows still pending watches [`Gate::contended`] and drains them to memory once
/// someone else queues, so a half-read result never blocks the connection.
pub(crate) struct Gate {
    lock: Arc<Mutex<()>>,
    queued: AtomicUsize,
    contended: Notify,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            queued: AtomicUsize::new(0),
            contended: Notify::new(),
        }
    }

    /// Wait for the permit. Dropping the future leaves the queue.
    pub(crate) async fn acquire(&self) -> OwnedMutexGuard<()> {
        let _queued = Queued::join(self);
        Arc::clone(&self.lock).lock_owned().await
    }

    /// Resolve once at least one caller is queued for the permit.
    pub(crate) async fn contended(&self) {
        loop {
            let notified = self.contended.notified();
            tokio::pin!(notified);
            // Register before checking so a queue-up in between is not missed.
            notified.as_mut().enable();
            if self.queued.load(Ordering::Acquire) > 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Queued<'a>(&'a Gate);

impl<'a> Queued<'a> {
    fn join(gate: &'a Gate) -> Self {
        gate.queued.fetch_add(1, Ordering::AcqRel);
        gate.contended.notify_waiters();
        Self(gate)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
