//! Durable actors: namespaces, live instances and their start-up barrier.

mod barrier;
mod env;
mod eviction;
mod fetch;
mod handle;
mod namespace;
mod state;

pub use barrier::InitBarrier;
pub use env::Env;
pub use eviction::{EvictionService, EvictionStats, NamespaceRegistry};
pub use fetch::{FetchRequest, FetchResponse};
pub use handle::ActorHandle;
pub use namespace::{Instance, Namespace, NamespaceOptions};
pub use state::ActorState;

use async_trait::async_trait;
use std::sync::Arc;

use crate::alarms::AlarmInfo;
use crate::rpc::Capability;
use crate::sockets::{HibernatableSocket, SocketMessage};
use crate::types::Result;

/// Builds the behavior object of one instance.
pub type ObjectFactory =
    Arc<dyn Fn(ActorState, Env) -> Result<Arc<dyn DurableObject>> + Send + Sync>;

/// Behavior of a durable class.
///
/// Methods reachable through stubs come from [`Capability`]; the handlers
/// below are invoked by the runtime. Every handler runs behind the
/// instance's start-up barrier.
#[async_trait]
pub trait DurableObject: Capability {
    async fn fetch(self: Arc<Self>, request: FetchRequest) -> Result<FetchResponse> {
        let _ = request;
        Ok(FetchResponse::not_found())
    }

    /// Invoked when the instance's alarm fires. An error schedules a retry.
    async fn alarm(self: Arc<Self>, info: AlarmInfo) -> Result<()> {
        let _ = info;
        Ok(())
    }

    async fn socket_message(
        self: Arc<Self>,
        socket: HibernatableSocket,
        message: SocketMessage,
    ) -> Result<()> {
        let _ = (socket, message);
        Ok(())
    }

    async fn socket_close(
        self: Arc<Self>,
        socket: HibernatableSocket,
        code: u16,
        reason: String,
        was_clean: bool,
    ) -> Result<()> {
        let _ = (socket, code, reason, was_clean);
        Ok(())
    }

    async fn socket_error(self: Arc<Self>, socket: HibernatableSocket, error: String) -> Result<()> {
        let _ = (socket, error);
        Ok(())
    }
}

/// Wrap a constructor closure as an [`ObjectFactory`].
pub fn factory<F, T>(f: F) -> ObjectFactory
where
    F: Fn(ActorState, Env) -> Result<T> + Send + Sync + 'static,
    T: DurableObject,
{
    Arc::new(move |state: ActorState, env: Env| -> Result<Arc<dyn DurableObject>> {
        let object: Arc<dyn DurableObject> = Arc::new(f(state, env)?);
        Ok(object)
    })
}
