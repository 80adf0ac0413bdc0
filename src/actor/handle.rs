//! The live instance behind an id.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::{ActorState, DurableObject, Env, FetchRequest, FetchResponse, InitBarrier, ObjectFactory};
use crate::alarms::AlarmInfo;
use crate::rpc::{Capability, RpcValue};
use crate::sockets::{SocketMessage, SocketRegistry};
use crate::storage::ActorStorage;
use crate::types::{InstanceId, Result, SocketId};

#[derive(Debug)]
struct Activity {
    last_active: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl Activity {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }
}

/// Marks one dispatch in progress for the eviction sweep.
struct ActiveCall<'a>(&'a Activity);

impl<'a> ActiveCall<'a> {
    fn enter(activity: &'a Activity) -> Self {
        activity.in_flight.fetch_add(1, Ordering::AcqRel);
        activity.touch();
        Self(activity)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.0.touch();
    }
}

/// One live instance: the behavior object plus its barrier, sockets and
/// storage. Every dispatch except socket auto-replies goes through the
/// barrier.
pub struct ActorHandle {
    namespace: String,
    id: InstanceId,
    object: Arc<dyn DurableObject>,
    storage: ActorStorage,
    sockets: Arc<SocketRegistry>,
    barrier: Arc<InitBarrier>,
    activity: Activity,
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("namespace", &self.namespace)
            .field("id", &self.id)
            .field("barrier", &self.barrier)
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

impl ActorHandle {
    /// Run the constructor for `id`. Start-up work it registers begins now.
    pub(crate) fn create(
        namespace: &str,
        id: InstanceId,
        storage: ActorStorage,
        factory: &ObjectFactory,
        env: Env,
    ) -> Result<Arc<Self>> {
        let barrier = Arc::new(InitBarrier::new());
        let sockets = Arc::new(SocketRegistry::new());
        let state = ActorState::new(id.clone(), storage.clone(), sockets.clone(), barrier.clone());
        let object = factory(state, env)?;
        tracing::debug!("instance_created: namespace={} id={}", namespace, id);

        Ok(Arc::new(Self {
            namespace: namespace.to_string(),
            id,
            object,
            storage,
            sockets,
            barrier,
            activity: Activity {
                last_active: Mutex::new(Instant::now()),
                in_flight: AtomicUsize::new(0),
            },
        }))
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn storage(&self) -> &ActorStorage {
        &self.storage
    }

    pub fn sockets(&self) -> &SocketRegistry {
        &self.sockets
    }

    pub fn barrier(&self) -> &InitBarrier {
        &self.barrier
    }

    /// Start-up failed; the namespace replaces this instance on next access.
    pub fn is_failed(&self) -> bool {
        self.barrier.failure().is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.activity.in_flight.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.activity.last_active.lock().unwrap_or_else(|p| p.into_inner());
        Instant::now().saturating_duration_since(last)
    }

    async fn dispatch<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let _active = ActiveCall::enter(&self.activity);
        self.barrier.run(job).await
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let object = self.object.clone();
        self.dispatch(async move { object.fetch(request).await }).await
    }

    pub async fn alarm(&self, info: AlarmInfo) -> Result<()> {
        let object = self.object.clone();
        self.dispatch(async move { object.alarm(info).await }).await
    }

    /// Deliver an inbound message. A configured auto-reply is answered here
    /// without waking the instance.
    pub async fn socket_message(&self, socket_id: &SocketId, message: SocketMessage) -> Result<()> {
        if self.sockets.try_auto_respond(socket_id, &message)? {
            return Ok(());
        }
        let Some(socket) = self.sockets.get(socket_id) else {
            tracing::debug!("socket_message_dropped: id={} reason=not_accepted", socket_id);
            return Ok(());
        };
        let object = self.object.clone();
        self.dispatch(async move { object.socket_message(socket, message).await })
            .await
    }

    /// Remove the socket and run the close handler, both behind the barrier.
    pub async fn socket_close(
        &self,
        socket_id: &SocketId,
        code: u16,
        reason: String,
        was_clean: bool,
    ) -> Result<()> {
        let object = self.object.clone();
        let sockets = self.sockets.clone();
        let socket_id = socket_id.clone();
        self.dispatch(async move {
            let Some(socket) = sockets.remove(&socket_id) else {
                return Ok(());
            };
            socket.mark_closed();
            object.socket_close(socket, code, reason, was_clean).await
        })
        .await
    }

    pub async fn socket_error(&self, socket_id: &SocketId, error: String) -> Result<()> {
        let Some(socket) = self.sockets.get(socket_id) else {
            return Ok(());
        };
        let object = self.object.clone();
        self.dispatch(async move { object.socket_error(socket, error).await })
            .await
    }

    /// The instance's own object comes back as this handle, so wrapping it
    /// yields the stub the caller already holds.
    fn resolve_self(self: &Arc<Self>, value: RpcValue) -> RpcValue {
        match value {
            RpcValue::Capability(target) if same_object(&target, &self.object) => {
                RpcValue::Capability(self.clone())
            }
            other => other,
        }
    }
}

fn same_object(target: &Arc<dyn Capability>, object: &Arc<dyn DurableObject>) -> bool {
    Arc::as_ptr(target) as *const () == Arc::as_ptr(object) as *const ()
}

#[async_trait]
impl Capability for ActorHandle {
    async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        let object = self.object.clone();
        let method = method.to_string();
        let result = self
            .dispatch(async move { object.call(&method, args).await })
            .await?;
        Ok(self.resolve_self(result))
    }

    async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
        let object = self.object.clone();
        let property = property.to_string();
        let result = self
            .dispatch(async move { object.get(&property).await })
            .await?;
        Ok(self.resolve_self(result))
    }
}
