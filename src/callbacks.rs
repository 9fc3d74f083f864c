// =============================================================================
// Callback fan-out: ordered handler lists with per-handler failure isolation
// =============================================================================
//
// Producers (stream client, tick store, aggregator) notify consumers through a
// `CallbackList`.  Handlers run synchronously in registration order, on a
// snapshot of the list taken under a short read lock, so a handler may call
// back into its producer (or register further handlers) without deadlocking.
//
// A handler that returns `Err` or panics is logged and counted; the remaining
// handlers still run and the producer's state is untouched.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{error, warn};

/// A registered consumer.
pub type Handler<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Opaque handle returned on registration, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Ordered list of handlers for items of type `T`.
pub struct CallbackList<T> {
    /// Used in log lines to tell the producers apart.
    name: &'static str,
    handlers: RwLock<Vec<(CallbackId, Handler<T>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
    slow_threshold: Duration,
}

impl<T: 'static> CallbackList<T> {
    pub fn new(name: &'static str, slow_threshold: Duration) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
            slow_threshold,
        }
    }

    /// Register a handler. Safe to call at any time, including from inside
    /// another handler; the new handler sees items from the next dispatch on.
    pub fn add<F>(&self, handler: F) -> CallbackId
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if the id was not registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Total handler failures (errors + panics) since construction.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Invoke every handler with `item`. Returns the number of handlers that
    /// failed during this dispatch.
    pub fn dispatch(&self, item: &T) -> usize {
        let snapshot: Vec<(CallbackId, Handler<T>)> = self
            .handlers
            .read()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        let mut failed = 0;
        for (id, handler) in snapshot {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(item)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    error!(callbacks = self.name, handler = id.0, error = %e, "callback failed");
                }
                Err(panic) => {
                    failed += 1;
                    error!(
                        callbacks = self.name,
                        handler = id.0,
                        panic = %panic_message(panic.as_ref()),
                        "callback panicked"
                    );
                }
            }

            if elapsed > self.slow_threshold {
                warn!(
                    callbacks = self.name,
                    handler = id.0,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow callback is delaying the producer"
                );
            }
        }

        if failed > 0 {
            self.failures.fetch_add(failed as u64, Ordering::Relaxed);
        }
        failed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
