//! Initialization barrier gating every dispatch into an instance.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::types::{Error, ErrorInfo, Result};

type Job = BoxFuture<'static, ()>;

enum BarrierState {
    Open,
    /// Start-up is running; dispatches wait here in arrival order.
    Blocked(Vec<Job>),
    /// Start-up failed; every dispatch is rejected with its error.
    Failed(ErrorInfo),
}

/// Queues dispatches while start-up work is outstanding.
pub struct InitBarrier {
    state: Mutex<BarrierState>,
}

impl fmt::Debug for InitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            BarrierState::Open => "open".to_string(),
            BarrierState::Blocked(queue) => format!("blocked({} queued)", queue.len()),
            BarrierState::Failed(info) => format!("failed({})", info),
        };
        f.debug_struct("InitBarrier").field("state", &state).finish()
    }
}

impl Default for InitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl InitBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::Open),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), BarrierState::Open)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(*self.lock(), BarrierState::Blocked(_))
    }

    pub fn failure(&self) -> Option<ErrorInfo> {
        match &*self.lock() {
            BarrierState::Failed(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Start queueing. Fails with `AlreadyInitializing` while a start-up is
    /// outstanding.
    pub(crate) fn block(&self) -> Result<()> {
        let mut state = self.lock();
        match &*state {
            BarrierState::Open => {
                *state = BarrierState::Blocked(Vec::new());
                Ok(())
            }
            BarrierState::Blocked(_) => Err(Error::AlreadyInitializing(
                "a start-up task is already pending for this instance".to_string(),
            )),
            BarrierState::Failed(info) => Err(Error::from_info(info.clone())),
        }
    }

    /// Reopen and hand back the queued dispatches, in arrival order.
    ///
    /// The caller drives the returned set; its first poll starts every job in
    /// the order it was queued.
    pub(crate) fn release(&self) -> FuturesUnordered<Job> {
        let queue = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, BarrierState::Open) {
                BarrierState::Blocked(queue) => queue,
                other => {
                    *state = other;
                    Vec::new()
                }
            }
        };
        tracing::debug!("barrier_released: queued={}", queue.len());
        queue.into_iter().collect()
    }

    /// Reject everything queued and everything that arrives later.
    pub(crate) fn fail(&self, info: ErrorInfo) {
        let queued = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, BarrierState::Failed(info.clone())) {
                BarrierState::Blocked(queue) => queue,
                _ => Vec::new(),
            }
        };
        tracing::warn!("barrier_failed: rejected={} error={}", queued.len(), info);
        // Dropping a job drops its sender, which rejects the waiting caller.
        drop(queued);
    }

    /// Run `job` now, or once start-up finishes.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut job = Some(job);
        let queued = {
            let mut state = self.lock();
            match &mut *state {
                BarrierState::Open => None,
                BarrierState::Failed(info) => return Err(Error::from_info(info.clone())),
                BarrierState::Blocked(queue) => {
                    let (tx, rx) = oneshot::channel();
                    if let Some(job) = job.take() {
                        queue.push(Box::pin(async move {
                            let _ = tx.send(job.await);
                        }));
                    }
                    Some(rx)
                }
            }
        };

        match (queued, job) {
            (Some(rx), _) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.rejection()),
            },
            (None, Some(job)) => job.await,
            (None, None) => Err(Error::internal("barrier job lost")),
        }
    }

    fn rejection(&self) -> Error {
        match self.failure() {
            Some(info) => Error::from_info(info),
            None => Error::internal("start-up was abandoned"),
        }
    }

    /// Block, run `startup` on the current runtime, then release or fail.
    pub(crate) fn start<F>(self: &std::sync::Arc<Self>, startup: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::internal("start-up work requires a tokio runtime"))?;
        self.block()?;

        let barrier = self.clone();
        runtime.spawn(async move {
            match startup.await {
                Ok(()) => {
                    let mut queued = barrier.release();
                    while queued.next().await.is_some() {}
                }
                Err(e) => barrier.fail(e.to_info()),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_barrier_runs_inline() {
        let barrier = InitBarrier::new();
        let value = barrier.run(async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
        assert!(barrier.is_open());
    }

    #[tokio::test]
    async fn test_queued_calls_run_after_startup_in_order() {
        let barrier = Arc::new(InitBarrier::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let startup_log = log.clone();
        barrier
            .start(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                startup_log.lock().unwrap().push("startup".to_string());
                Ok(())
            })
            .unwrap();

        let mut calls = Vec::new();
        for i in 0..5 {
            let barrier = barrier.clone();
            let log = log.clone();
            calls.push(tokio::spawn(async move {
                barrier
                    .run(async move {
                        log.lock().unwrap().push(format!("call-{i}"));
                        Ok(i)
                    })
                    .await
            }));
            // Issue in a known order.
            tokio::task::yield_now().await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), i);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["startup", "call-0", "call-1", "call-2", "call-3", "call-4"]
        );
    }

    #[tokio::test]
    async fn test_second_startup_is_rejected() {
        let barrier = Arc::new(InitBarrier::new());
        let (tx, rx) = oneshot::channel::<()>();
        barrier
            .start(async move {
                let _ = rx.await;
                Ok(())
            })
            .unwrap();

        let err = barrier.start(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitializing(_)));

        tx.send(()).unwrap();
        barrier.run(async { Ok(()) }).await.unwrap();
        // Released barriers may block again.
        barrier.start(async { Ok(()) }).unwrap();
    }

    #[tokio::test]
    async fn test_failed_startup_rejects_queued_and_later_calls() {
        let barrier = Arc::new(InitBarrier::new());
        barrier
            .start(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(Error::actor("StartupError", "schema missing"))
            })
            .unwrap();

        let queued = barrier.run(async { Ok(()) }).await.unwrap_err();
        assert_eq!(queued.code(), "StartupError");

        let later = barrier.run(async { Ok(()) }).await.unwrap_err();
        assert_eq!(later.code(), "StartupError");
        assert!(barrier.failure().is_some());
        assert!(!barrier.is_open());
    }
}
