//! Per-instance state handed to the constructor.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use super::InitBarrier;
use crate::sockets::{AutoResponse, HibernatableSocket, SocketRegistry};
use crate::storage::ActorStorage;
use crate::types::{InstanceId, Result};

/// Everything an instance owns: its id, storage, sockets and barrier.
#[derive(Debug, Clone)]
pub struct ActorState {
    id: InstanceId,
    storage: ActorStorage,
    sockets: Arc<SocketRegistry>,
    barrier: Arc<InitBarrier>,
}

impl ActorState {
    pub(crate) fn new(
        id: InstanceId,
        storage: ActorStorage,
        sockets: Arc<SocketRegistry>,
        barrier: Arc<InitBarrier>,
    ) -> Self {
        Self {
            id,
            storage,
            sockets,
            barrier,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn storage(&self) -> &ActorStorage {
        &self.storage
    }

    /// Queue every dispatch until `startup` finishes.
    ///
    /// Queued calls then run in arrival order. Fails with
    /// `AlreadyInitializing` while another start-up is still pending.
    pub fn block_on_startup<F>(&self, startup: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tracing::debug!("startup_blocked: instance={}", self.id);
        self.barrier.start(startup)
    }

    /// Keep `socket` across calls under `tags`.
    pub fn accept_socket(&self, socket: HibernatableSocket, tags: Vec<String>) -> Result<()> {
        self.sockets.accept(socket.clone(), tags.clone())?;
        socket.notify_accepted(&tags)
    }

    /// Accepted sockets, optionally only those tagged `tag`.
    pub fn sockets(&self, tag: Option<&str>) -> Vec<HibernatableSocket> {
        self.sockets.list(tag)
    }

    pub fn tags_of(&self, socket: &HibernatableSocket) -> Vec<String> {
        self.sockets.tags_of(socket.id())
    }

    /// Answer `pair.request` with `pair.response` without waking the instance.
    ///
    /// Replies bypass the start-up barrier, so they also fire while
    /// `block_on_startup` work is still running.
    pub fn set_auto_response(&self, pair: Option<AutoResponse>) {
        self.sockets.set_auto_response(pair);
    }

    pub fn auto_response(&self) -> Option<AutoResponse> {
        self.sockets.auto_response()
    }

    pub fn auto_response_timestamp(&self, socket: &HibernatableSocket) -> Option<DateTime<Utc>> {
        self.sockets.auto_response_timestamp(socket.id())
    }
}
