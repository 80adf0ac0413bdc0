//! Identity-keyed stub cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use super::stub::StubInner;
use super::{Capability, RpcValue, Stub};
use crate::types::{Error, Result};

/// Entries are swept once the map grows past this many.
const MIN_PRUNE_THRESHOLD: usize = 64;

struct Entry {
    target: Weak<dyn Capability>,
    stub: Weak<StubInner>,
}

struct TableState {
    entries: HashMap<usize, Entry>,
    prune_at: usize,
}

struct TableInner {
    state: Mutex<TableState>,
    next_handle: AtomicU64,
}

/// Maps a target's address to its stub, so wrapping the same target twice
/// yields the same stub while that stub is alive.
///
/// Entries hold weak references only; an entry whose target is gone is
/// swept the next time the table grows past its threshold.
#[derive(Clone)]
pub struct HandleTable {
    inner: Arc<TableInner>,
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("entries", &self.lock().entries.len())
            .finish()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_TABLE: OnceLock<HandleTable> = OnceLock::new();

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState {
                    entries: HashMap::new(),
                    prune_at: MIN_PRUNE_THRESHOLD,
                }),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Process-wide table used by namespaces.
    pub fn global() -> &'static HandleTable {
        GLOBAL_TABLE.get_or_init(HandleTable::new)
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// The cached stub for `target`, or a new one. Stubs wrap to themselves.
    pub fn wrap(&self, target: Arc<dyn Capability>) -> Stub {
        if let Some(stub) = target.clone().as_stub() {
            return stub;
        }

        let addr = address_of(&target);
        let mut state = self.lock();
        if let Some(entry) = state.entries.get(&addr) {
            if let (Some(_), Some(stub)) = (entry.target.upgrade(), entry.stub.upgrade()) {
                return Stub::from_inner(stub);
            }
        }

        let stub = Stub::new_in(self.clone(), target.clone(), self.next_handle());
        state.entries.insert(
            addr,
            Entry {
                target: Arc::downgrade(&target),
                stub: stub.downgrade(),
            },
        );
        if state.entries.len() >= state.prune_at {
            prune(&mut state);
        }
        tracing::trace!("stub_created: handle={} addr={:#x}", stub.handle(), addr);
        stub
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.target.strong_count() > 0 && e.stub.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert a value handed to a capability member.
    pub(crate) fn wrap_argument(&self, index: usize, value: RpcValue) -> Result<RpcValue> {
        match value {
            RpcValue::Object(object) => Err(Error::invalid_argument(format!(
                "argument {} is a {} which is neither plain data, a capability nor a function",
                index,
                object.type_name()
            ))),
            other => Ok(self.wrap_passable(other)),
        }
    }

    pub(crate) fn wrap_arguments(&self, args: Vec<RpcValue>) -> Result<Vec<RpcValue>> {
        args.into_iter()
            .enumerate()
            .map(|(index, value)| self.wrap_argument(index, value))
            .collect()
    }

    /// Convert a value returned from a capability member.
    pub(crate) fn wrap_return(&self, value: RpcValue) -> Result<RpcValue> {
        match value {
            RpcValue::Object(object) => Err(Error::invalid_return_value(format!(
                "result is a {} which is neither plain data, a capability nor a function",
                object.type_name()
            ))),
            other => Ok(self.wrap_passable(other)),
        }
    }

    fn wrap_passable(&self, value: RpcValue) -> RpcValue {
        match value {
            RpcValue::Capability(target) => self.wrap(target).into_value(),
            RpcValue::Function(function) => RpcValue::Function(function.stubbed(self)),
            other => other,
        }
    }
}

fn address_of(target: &Arc<dyn Capability>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

fn prune(state: &mut TableState) {
    let before = state.entries.len();
    state
        .entries
        .retain(|_, e| e.target.strong_count() > 0 && e.stub.strong_count() > 0);
    state.prune_at = (state.entries.len() * 2).max(MIN_PRUNE_THRESHOLD);
    tracing::trace!(
        "stub_table_pruned: removed={} remaining={}",
        before - state.entries.len(),
        state.entries.len()
    );
}
