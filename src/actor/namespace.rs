//! Namespaces: class name to live instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use super::{ActorHandle, Env, FetchRequest, FetchResponse, ObjectFactory};
use crate::alarms::{AlarmInfo, AlarmScheduler, AlarmTarget};
use crate::executor::{ExecutorSpec, ExecutorStatus, IsolatedExecutor};
use crate::rpc::{Capability, HandleTable, Stub};
use crate::sockets::SocketMessage;
use crate::storage::{ActorStorage, AlarmControl, Partition, StorageEngine};
use crate::types::{Error, ExecutorConfig, InstanceId, Result, SocketId};

/// How a namespace runs its instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceOptions {
    /// Run every instance on its own executor thread.
    #[serde(default)]
    pub isolated: bool,

    /// Executor transport settings. `None` takes the runtime's (or the
    /// defaults for a namespace built directly).
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
}

impl NamespaceOptions {
    pub fn isolated() -> Self {
        Self {
            isolated: true,
            ..Self::default()
        }
    }
}

/// A live instance, in-process or on an executor thread.
#[derive(Debug, Clone)]
pub enum Instance {
    Local(Arc<ActorHandle>),
    Isolated(Arc<IsolatedExecutor>),
}

impl Instance {
    pub fn capability(&self) -> Arc<dyn Capability> {
        match self {
            Self::Local(handle) => handle.clone(),
            Self::Isolated(executor) => executor.clone(),
        }
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        match self {
            Self::Local(handle) => handle.fetch(request).await,
            Self::Isolated(executor) => executor.fetch(request).await,
        }
    }

    pub async fn alarm(&self, info: AlarmInfo) -> Result<()> {
        match self {
            Self::Local(handle) => handle.alarm(info).await,
            Self::Isolated(executor) => executor.alarm(info).await,
        }
    }

    pub async fn socket_message(&self, socket_id: &SocketId, message: SocketMessage) -> Result<()> {
        match self {
            Self::Local(handle) => handle.socket_message(socket_id, message).await,
            Self::Isolated(executor) => executor.socket_message(socket_id, message),
        }
    }

    pub async fn socket_close(
        &self,
        socket_id: &SocketId,
        code: u16,
        reason: impl Into<String>,
        was_clean: bool,
    ) -> Result<()> {
        let reason = reason.into();
        match self {
            Self::Local(handle) => handle.socket_close(socket_id, code, reason, was_clean).await,
            Self::Isolated(executor) => executor.socket_close(socket_id, code, reason, was_clean),
        }
    }

    pub async fn socket_error(&self, socket_id: &SocketId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        match self {
            Self::Local(handle) => handle.socket_error(socket_id, error).await,
            Self::Isolated(executor) => executor.socket_error(socket_id, error),
        }
    }

    /// Broken beyond use; the namespace builds a replacement on next access.
    pub fn is_failed(&self) -> bool {
        match self {
            Self::Local(handle) => handle.is_failed(),
            Self::Isolated(executor) => executor.is_disposed(),
        }
    }

    /// Idle, unreferenced and holding nothing that must stay live.
    ///
    /// Call only while the namespace's map holds the sole reference.
    fn is_evictable(&self, idle_timeout: Duration) -> bool {
        match self {
            Self::Local(handle) => {
                Arc::strong_count(handle) == 1
                    && handle.in_flight() == 0
                    && !handle.barrier().is_blocked()
                    && handle.sockets().is_empty()
                    && handle.idle_for() >= idle_timeout
            }
            Self::Isolated(executor) => {
                Arc::strong_count(executor) == 1
                    && executor.status() == ExecutorStatus::Ready
                    && executor.pending() == 0
                    && executor.socket_count() == 0
                    && executor.idle_for() >= idle_timeout
            }
        }
    }

    fn dispose(&self) {
        if let Self::Isolated(executor) = self {
            executor.dispose();
        }
    }

    /// Dispose and reject every later dispatch, including through stubs
    /// that outlive the namespace's reference.
    fn retire(&self, reason: &str) {
        match self {
            Self::Local(handle) => handle.barrier().fail(Error::internal(reason).to_info()),
            Self::Isolated(executor) => executor.dispose(),
        }
    }
}

#[derive(Clone)]
struct Binding {
    factory: ObjectFactory,
    env: Env,
}

struct NamespaceInner {
    class_name: String,
    engine: StorageEngine,
    scheduler: AlarmScheduler,
    table: HandleTable,
    options: NamespaceOptions,
    binding: RwLock<Option<Binding>>,
    instances: Mutex<HashMap<InstanceId, Instance>>,
}

impl NamespaceInner {
    fn lock_instances(&self) -> MutexGuard<'_, HashMap<InstanceId, Instance>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn binding(&self) -> Result<Binding> {
        self.binding
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| {
                Error::BindingNotWired(format!("namespace {} has no class bound", self.class_name))
            })
    }

    /// The live instance for `id`, constructing it on first access.
    ///
    /// The constructor runs without the map locked, so it may reach other
    /// instances of this namespace. When two callers race, the first insert
    /// wins and the other's instance is discarded.
    fn instance(&self, id: &InstanceId) -> Result<Instance> {
        let binding = self.binding()?;
        let replaced = {
            let mut instances = self.lock_instances();
            if let Some(existing) = instances.get(id).filter(|i| !i.is_failed()) {
                return Ok(existing.clone());
            }
            instances.remove(id)
        };
        if let Some(failed) = replaced {
            tracing::info!(
                "instance_replaced: namespace={} id={} reason=failed",
                self.class_name,
                id
            );
            failed.dispose();
        }

        let created = self.create(id.clone(), &binding)?;
        let mut instances = self.lock_instances();
        let winner = instances.get(id).filter(|i| !i.is_failed()).cloned();
        if let Some(winner) = winner {
            drop(instances);
            created.dispose();
            return Ok(winner);
        }
        let previous = instances.insert(id.clone(), created.clone());
        drop(instances);
        if let Some(previous) = previous {
            previous.dispose();
        }
        Ok(created)
    }

    fn create(&self, id: InstanceId, binding: &Binding) -> Result<Instance> {
        if self.options.isolated {
            let executor = IsolatedExecutor::spawn(ExecutorSpec {
                class_name: self.class_name.clone(),
                id,
                engine: self.engine.clone(),
                scheduler: self.scheduler.clone(),
                factory: binding.factory.clone(),
                env: binding.env.clone(),
                config: self.options.executor.clone().unwrap_or_default(),
            })?;
            return Ok(Instance::Isolated(executor));
        }

        let partition = Partition::new(self.class_name.clone(), id.clone());
        let storage = ActorStorage::new(
            partition,
            self.engine.clone(),
            AlarmControl::Scheduler(self.scheduler.clone()),
        );
        let handle = ActorHandle::create(&self.class_name, id, storage, &binding.factory, binding.env.clone())?;
        Ok(Instance::Local(handle))
    }
}

#[async_trait]
impl AlarmTarget for NamespaceInner {
    async fn fire(&self, id: InstanceId, info: AlarmInfo) -> Result<()> {
        let instance = self.instance(&id)?;
        instance.alarm(info).await
    }
}

/// Binds a class name to a behavior factory and owns at most one live
/// instance per id.
///
/// Cloning is cheap; clones share the same instances.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("class_name", &self.inner.class_name)
            .field("isolated", &self.inner.options.isolated)
            .field("live_instances", &self.live_instances())
            .finish()
    }
}

impl Namespace {
    pub fn new(
        class_name: impl Into<String>,
        engine: StorageEngine,
        scheduler: AlarmScheduler,
        options: NamespaceOptions,
    ) -> Self {
        Self {
            inner: Arc::new(NamespaceInner {
                class_name: class_name.into(),
                engine,
                scheduler,
                table: HandleTable::global().clone(),
                options,
                binding: RwLock::new(None),
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// Deterministic id for `name` within this class.
    pub fn id_from_name(&self, name: &str) -> InstanceId {
        InstanceId::from_name(&self.inner.class_name, name)
    }

    /// Wrap `raw` verbatim.
    pub fn id_from_string(&self, raw: impl Into<String>) -> Result<InstanceId> {
        InstanceId::from_string(raw).map_err(Error::validation)
    }

    pub fn new_unique_id(&self) -> InstanceId {
        InstanceId::unique()
    }

    /// Stub for the live instance of `id`, created on first access.
    pub fn get(&self, id: &InstanceId) -> Result<Stub> {
        let instance = self.inner.instance(id)?;
        Ok(self.inner.table.wrap(instance.capability()))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Stub> {
        self.get(&self.id_from_name(name))
    }

    /// The live instance of `id`, for fetch and socket delivery.
    pub fn instance(&self, id: &InstanceId) -> Result<Instance> {
        self.inner.instance(id)
    }

    pub async fn fetch(&self, id: &InstanceId, request: FetchRequest) -> Result<FetchResponse> {
        self.instance(id)?.fetch(request).await
    }

    pub fn bind(&self, factory: ObjectFactory) -> Result<()> {
        self.bind_with_env(factory, Env::default())
    }

    /// Attach the behavior class. Live instances of an earlier binding are
    /// retired, so stubs still pointing at them fail, and persisted alarms
    /// of this namespace are re-armed.
    pub fn bind_with_env(&self, factory: ObjectFactory, env: Env) -> Result<()> {
        *self
            .inner
            .binding
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Binding { factory, env });

        let stale: Vec<Instance> = self.inner.lock_instances().drain().map(|(_, i)| i).collect();
        for instance in &stale {
            instance.retire("namespace rebound");
        }

        let target: Weak<dyn AlarmTarget> = Arc::downgrade(&self.inner) as Weak<dyn AlarmTarget>;
        self.inner
            .scheduler
            .register_target(self.inner.class_name.clone(), target);
        let restored = self.inner.scheduler.restore(&self.inner.class_name)?;

        tracing::info!(
            "namespace_bound: class={} dropped_instances={} restored_alarms={}",
            self.inner.class_name,
            stale.len(),
            restored
        );
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.binding().is_ok()
    }

    pub fn live_instances(&self) -> usize {
        self.inner.lock_instances().len()
    }

    pub fn is_live(&self, id: &InstanceId) -> bool {
        self.inner.lock_instances().contains_key(id)
    }

    /// Drop every instance idle for at least `idle_timeout` that nothing
    /// references and that has no sockets, start-up or armed alarm.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let scheduler = &self.inner.scheduler;
        let class_name = &self.inner.class_name;
        let mut evicted = Vec::new();
        {
            let mut instances = self.inner.lock_instances();
            instances.retain(|id, instance| {
                let partition = Partition::new(class_name.clone(), id.clone());
                if instance.is_evictable(idle_timeout) && !scheduler.is_armed(&partition) {
                    evicted.push((id.clone(), instance.clone()));
                    return false;
                }
                true
            });
        }

        for (id, instance) in &evicted {
            instance.dispose();
            tracing::debug!("instance_evicted: namespace={} id={}", class_name, id);
        }
        evicted.len()
    }

    /// Dispose executors and drop every live instance.
    pub fn shutdown(&self) {
        let instances: Vec<Instance> = self.inner.lock_instances().drain().map(|(_, i)| i).collect();
        for instance in instances {
            instance.dispose();
        }
    }
}
