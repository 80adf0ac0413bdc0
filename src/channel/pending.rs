//! Correlation-id table for in-flight requests.
//!
//! Each request gets a monotonically increasing id and a oneshot waiter.
//! Responses may arrive in any order; closing the table rejects everything
//! still waiting and refuses new registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::types::{Error, Result};

/// Receiver half handed to the caller of [`PendingTable::register`].
pub type PendingReceiver<T> = oneshot::Receiver<Result<T>>;

#[derive(Debug)]
struct PendingState<T> {
    waiters: HashMap<u64, oneshot::Sender<Result<T>>>,
    closed: Option<String>,
}

/// Pending request table keyed by correlation id.
#[derive(Debug)]
pub struct PendingTable<T> {
    next_id: AtomicU64,
    state: Mutex<PendingState<T>>,
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState {
                waiters: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a correlation id and its waiter.
    ///
    /// Fails with `ExecutorTerminated` once the table is closed.
    pub fn register(&self) -> Result<(u64, PendingReceiver<T>)> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(Error::executor_terminated(reason.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Complete the waiter for `id`. Returns false for unknown ids.
    pub fn resolve(&self, id: u64, result: Result<T>) -> bool {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // Receiver may have given up (timeout); nothing to do then.
                let _ = tx.send(result);
                true
            }
            None => {
                tracing::warn!("pending_result_unmatched: id={}", id);
                false
            }
        }
    }

    /// Drop the waiter for `id` without completing it.
    pub fn forget(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// Reject every waiter and refuse new registrations. Returns how many
    /// waiters were rejected. Only the first close records its reason.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::executor_terminated(reason)));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Await a registered waiter, mapping a dropped sender to `ExecutorTerminated`.
pub async fn wait<T>(rx: PendingReceiver<T>) -> Result<T> {
    rx.await
        .map_err(|_| Error::executor_terminated("response channel dropped"))?
}
