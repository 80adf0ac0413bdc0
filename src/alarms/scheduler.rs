//! Process-wide alarm timer.
//!
//! One loop task owns a min-heap of wake-ups. Every armed alarm carries a
//! generation and a cancellation token; re-arming or disarming bumps the
//! generation so stale heap entries are skipped when they surface, and
//! cancels any backoff still waiting on the old generation.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AlarmInfo, AlarmTarget, RetryPolicy};
use crate::storage::{Partition, StorageEngine};
use crate::types::{AlarmConfig, Error, Result};

/// Used when a fire time is too far out to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Heap entry. Ordered so the earliest wake-up sits at the top of the max-heap.
#[derive(Debug, PartialEq, Eq)]
struct Wakeup {
    at: Instant,
    generation: u64,
    key: Partition,
}

impl Ord for Wakeup {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap, so reverse time
        other
            .at
            .cmp(&self.at)
            // Then arming order for the same instant
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    fire_at: DateTime<Utc>,
    token: CancellationToken,
    started: bool,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Wakeup>,
    armed: HashMap<Partition, Armed>,
    targets: HashMap<String, Weak<dyn AlarmTarget>>,
}

struct SchedulerInner {
    engine: StorageEngine,
    policy: RetryPolicy,
    state: Mutex<SchedulerState>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    generations: AtomicU64,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Schedules, persists and retries the single pending alarm of every instance.
#[derive(Clone)]
pub struct AlarmScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for AlarmScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmScheduler")
            .field("policy", &self.inner.policy)
            .field("armed", &self.armed_count())
            .finish_non_exhaustive()
    }
}

impl AlarmScheduler {
    /// Start the scheduler loop on the current tokio runtime.
    pub fn start(engine: StorageEngine, config: AlarmConfig) -> Self {
        let inner = Arc::new(SchedulerInner {
            engine,
            policy: RetryPolicy::from_config(&config),
            state: Mutex::new(SchedulerState::default()),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            generations: AtomicU64::new(1),
        });

        tokio::spawn(run_loop(
            Arc::downgrade(&inner),
            inner.notify.clone(),
            inner.shutdown.clone(),
        ));
        tracing::debug!("alarm_scheduler_started: max_retries={}", config.max_retries);

        Self { inner }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Route firings for `namespace` to `target`. Replaces any earlier target.
    pub fn register_target(&self, namespace: impl Into<String>, target: Weak<dyn AlarmTarget>) {
        self.inner.lock().targets.insert(namespace.into(), target);
    }

    /// Persist `time` for `partition` and (re)arm its timer; the latest call wins.
    pub fn set_alarm(&self, partition: &Partition, time: DateTime<Utc>) -> Result<()> {
        let mut state = self.inner.lock();
        self.inner.engine.put_alarm(partition, time)?;
        self.inner.arm_locked(&mut state, partition.clone(), time);
        Ok(())
    }

    /// Delete the persisted row and cancel the timer. Idempotent.
    pub fn delete_alarm(&self, partition: &Partition) -> Result<()> {
        let mut state = self.inner.lock();
        self.inner.engine.delete_alarm(partition)?;
        if disarm_locked(&mut state, partition) {
            tracing::debug!("alarm_deleted: partition={}", partition);
        }
        Ok(())
    }

    pub fn get_alarm(&self, partition: &Partition) -> Result<Option<DateTime<Utc>>> {
        self.inner.engine.get_alarm(partition)
    }

    /// Arm a timer without touching the persisted row.
    pub fn arm(&self, partition: Partition, time: DateTime<Utc>) {
        let mut state = self.inner.lock();
        self.inner.arm_locked(&mut state, partition, time);
    }

    /// Cancel the timer without touching the persisted row.
    pub fn disarm(&self, partition: &Partition) -> bool {
        disarm_locked(&mut self.inner.lock(), partition)
    }

    /// Whether a timer is armed (or a firing is in progress) for `partition`.
    pub fn is_armed(&self, partition: &Partition) -> bool {
        self.inner.lock().armed.contains_key(partition)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock().armed.len()
    }

    /// Re-arm every persisted alarm of `namespace` that has no live timer.
    ///
    /// Rows already in the past fire immediately.
    pub fn restore(&self, namespace: &str) -> Result<usize> {
        let rows = self.inner.engine.list_alarms(Some(namespace))?;
        let mut state = self.inner.lock();
        let mut restored = 0;
        for row in rows {
            if state.armed.contains_key(&row.partition) {
                continue;
            }
            self.inner.arm_locked(&mut state, row.partition, row.fire_time);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("alarms_restored: namespace={} count={}", namespace, restored);
        }
        Ok(restored)
    }

    /// Stop the loop and cancel every pending backoff. Persisted rows stay.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.lock();
        for (_, armed) in state.armed.drain() {
            armed.token.cancel();
        }
        state.heap.clear();
        tracing::info!("alarm_scheduler_stopped");
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_locked(&self, state: &mut SchedulerState, key: Partition, fire_at: DateTime<Utc>) {
        let generation = self.generations.fetch_add(1, AtomicOrdering::Relaxed);
        let armed = Armed {
            generation,
            fire_at,
            token: CancellationToken::new(),
            started: false,
        };
        if let Some(previous) = state.armed.insert(key.clone(), armed) {
            previous.token.cancel();
        }
        tracing::debug!("alarm_armed: partition={} fire_at={}", key, fire_at);
        state.heap.push(Wakeup {
            at: instant_for(fire_at),
            generation,
            key,
        });
        self.notify.notify_one();
    }

    /// Start a firing task for every due wake-up; returns the next deadline.
    fn dispatch_due(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let mut due = Vec::new();
        let next = {
            let mut state = self.lock();
            loop {
                let Some(top) = state.heap.peek() else {
                    break None;
                };
                let live = state
                    .armed
                    .get(&top.key)
                    .is_some_and(|armed| armed.generation == top.generation && !armed.started);
                if !live {
                    state.heap.pop();
                    continue;
                }
                if top.at > now {
                    break Some(top.at);
                }
                if let Some(wakeup) = state.heap.pop() {
                    if let Some(armed) = state.armed.get_mut(&wakeup.key) {
                        armed.started = true;
                        tracing::debug!(
                            "alarm_due: partition={} scheduled_for={}",
                            wakeup.key,
                            armed.fire_at
                        );
                        due.push((wakeup.key, wakeup.generation, armed.token.clone()));
                    }
                }
            }
        };

        for (key, generation, token) in due {
            tokio::spawn(run_alarm(self.clone(), key, generation, token));
        }
        next
    }

    fn target(&self, namespace: &str) -> Option<Arc<dyn AlarmTarget>> {
        let mut state = self.lock();
        let target = state.targets.get(namespace).and_then(Weak::upgrade);
        if target.is_none() {
            state.targets.remove(namespace);
        }
        target
    }

    /// Drop the armed entry of `generation` but keep its row.
    fn release(&self, key: &Partition, generation: u64) {
        let mut state = self.lock();
        if state.armed.get(key).is_some_and(|a| a.generation == generation) {
            state.armed.remove(key);
        }
    }

    /// Drop the armed entry and its row, unless a newer set/delete replaced it.
    fn complete(&self, key: &Partition, generation: u64) {
        let mut state = self.lock();
        if !state.armed.get(key).is_some_and(|a| a.generation == generation) {
            return;
        }
        state.armed.remove(key);
        if let Err(e) = self.engine.delete_alarm(key) {
            tracing::error!("alarm_row_delete_failed: partition={} error={}", key, e);
        }
    }
}

fn disarm_locked(state: &mut SchedulerState, key: &Partition) -> bool {
    match state.armed.remove(key) {
        Some(armed) => {
            armed.token.cancel();
            true
        }
        None => false,
    }
}

fn instant_for(fire_at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    match (fire_at - Utc::now()).to_std() {
        Ok(delay) => now.checked_add(delay).unwrap_or(now + FAR_FUTURE),
        // Already in the past
        Err(_) => now,
    }
}

async fn run_loop(inner: Weak<SchedulerInner>, notify: Arc<Notify>, shutdown: CancellationToken) {
    loop {
        let next = match inner.upgrade() {
            Some(inner) => inner.dispatch_due(),
            None => break,
        };

        match next {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = notify.notified() => {}
                _ = shutdown.cancelled() => break,
            },
            None => tokio::select! {
                _ = notify.notified() => {}
                _ = shutdown.cancelled() => break,
            },
        }
    }
    tracing::debug!("alarm_loop_exited");
}

/// Invoke the handler for one armed generation, retrying on failure.
async fn run_alarm(
    inner: Arc<SchedulerInner>,
    key: Partition,
    generation: u64,
    token: CancellationToken,
) {
    let mut retry_count = 0;
    loop {
        let Some(target) = inner.target(&key.namespace) else {
            // Row stays; it is restored when the namespace is bound.
            tracing::warn!("alarm_target_missing: partition={}", key);
            inner.release(&key, generation);
            return;
        };

        let info = AlarmInfo {
            retry_count,
            is_retry: retry_count > 0,
        };
        tracing::debug!("alarm_fired: partition={} retry_count={}", key, retry_count);
        let outcome = target.fire(key.instance.clone(), info).await;
        drop(target);

        let error = match outcome {
            Ok(()) => {
                inner.complete(&key, generation);
                return;
            }
            Err(e) => Error::AlarmHandlerFailed {
                retry_count,
                source: Box::new(e),
            },
        };

        if !inner.policy.should_retry(retry_count) {
            tracing::error!("alarm_retries_exhausted: partition={} error={}", key, error);
            inner.complete(&key, generation);
            return;
        }

        let delay = inner.policy.backoff(retry_count);
        tracing::warn!(
            "alarm_retry_scheduled: partition={} delay={:?} error={}",
            key,
            delay,
            error
        );
        tokio::select! {
            _ = token.cancelled() => return,
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        retry_count += 1;
    }
}
