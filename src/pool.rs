//! Bounded worker pool for method execution.
//!
//! Every submitted call gets its own task, but only `capacity` of them run a
//! method body at any time; the rest wait for a semaphore permit. Waiting
//! time counts against the caller's budget: a saturated pool degrades into
//! timeouts, never into an explicit rejection.
//!
//! A queued call whose completion receiver has been dropped (the engine gave
//! up on it) is skipped without running. A call that already started is never
//! interrupted. Panics are caught here and reported as [`TaskResult::Panicked`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};

use crate::service::{BoxFuture, CallOutcome};

/// How a pooled call ended.
#[derive(Debug)]
pub enum TaskResult {
    Completed(CallOutcome),
    Panicked(String),
}

/// Worker pool shared by every service in the process.
///
/// The admission queue has no length limit of its own: it is bounded by the
/// callers' deadlines. A queued call leaves the queue as soon as its waiter
/// drops the receiver, which the engine does when the budget runs out, so at
/// most `arrival rate x process timeout` calls can be waiting.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a prepared call. The outcome is sent on `done` unless the
    /// receiver is gone before the call gets a worker.
    pub fn submit(&self, task: BoxFuture<'static, CallOutcome>, mut done: oneshot::Sender<TaskResult>) {
        let permits = Arc::clone(&self.permits);
        let queued = Arc::clone(&self.queued);
        queued.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = done.closed() => {
                    queued.fetch_sub(1, Ordering::Relaxed);
                    tracing::debug!("call abandoned while queued");
                    return;
                }
            };
            queued.fetch_sub(1, Ordering::Relaxed);

            let Ok(_permit) = permit else {
                return;
            };
            if done.is_closed() {
                tracing::debug!("call abandoned before start");
                return;
            }

            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(outcome) => TaskResult::Completed(outcome),
                Err(panic) => TaskResult::Panicked(panic_message(panic.as_ref())),
            };
            let _ = done.send(result);
        });
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently running a method.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Calls waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
