//! Initiator side: the handle a namespace holds for an isolated instance.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::host::{self, HostSpec};
use super::protocol::{BridgePayload, Command, CommandResult, FromExecutor, InitConfig, ToExecutor};
use crate::actor::{Env, FetchRequest, FetchResponse, ObjectFactory};
use crate::alarms::{AlarmInfo, AlarmScheduler};
use crate::channel::codec::{FRAME_FROM_EXECUTOR, FRAME_TO_EXECUTOR};
use crate::channel::framed::{self, FrameConfig, FramedEndpoint};
use crate::channel::pending::{self, PendingTable};
use crate::rpc::{Capability, RpcValue};
use crate::sockets::{HibernatableSocket, SocketMessage};
use crate::storage::{Partition, StorageEngine};
use crate::types::{Error, ExecutorConfig, InstanceId, Result, SocketId};

/// Everything needed to start an executor for one instance.
pub struct ExecutorSpec {
    pub class_name: String,
    pub id: InstanceId,
    pub engine: StorageEngine,
    pub scheduler: AlarmScheduler,
    pub factory: ObjectFactory,
    pub env: Env,
    pub config: ExecutorConfig,
}

impl fmt::Debug for ExecutorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorSpec")
            .field("class_name", &self.class_name)
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of an executor as seen from the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorStatus {
    /// Waiting for `Ready`.
    Starting,
    Ready,
    /// Terminal. Carries the reason.
    Disposed(String),
}

#[derive(Debug, Default)]
struct SocketTable {
    live: HashMap<SocketId, HibernatableSocket>,
    accepted: HashSet<SocketId>,
}

/// State shared between the executor handle and its reader task.
#[derive(Debug)]
struct Shared {
    init: InitConfig,
    partition: Partition,
    scheduler: AlarmScheduler,
    pending: PendingTable<CommandResult>,
    status: watch::Sender<ExecutorStatus>,
    sockets: Mutex<SocketTable>,
}

impl Shared {
    fn sockets(&self) -> MutexGuard<'_, SocketTable> {
        self.sockets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `Disposed` and reject everything outstanding. Returns false
    /// when already disposed.
    fn terminate(&self, reason: &str) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if matches!(status, ExecutorStatus::Disposed(_)) {
                return false;
            }
            *status = ExecutorStatus::Disposed(reason.to_string());
            true
        });
        if !changed {
            return false;
        }
        let rejected = self.pending.close(reason);
        tracing::info!(
            "executor_terminated: namespace={} id={} reason={} rejected={}",
            self.init.class_name,
            self.init.instance_id,
            reason,
            rejected
        );
        true
    }

    fn handle(&self, message: FromExecutor, outbound: &mpsc::UnboundedSender<ToExecutor>) {
        match message {
            FromExecutor::NeedInit => {
                let _ = outbound.send(ToExecutor::Init {
                    config: self.init.clone(),
                });
            }
            FromExecutor::Ready => {
                self.status.send_if_modified(|status| {
                    if *status != ExecutorStatus::Starting {
                        return false;
                    }
                    *status = ExecutorStatus::Ready;
                    true
                });
            }
            FromExecutor::Result { id, result } => {
                let outcome = match result {
                    CommandResult::Error { error } => Err(Error::from_info(error)),
                    other => Ok(other),
                };
                self.pending.resolve(id, outcome);
            }
            FromExecutor::AlarmSet { time } => {
                // The executor already persisted the row; this re-writes it
                // under the scheduler lock and arms or disarms the timer.
                let applied = match time {
                    Some(time) => self.scheduler.set_alarm(&self.partition, time),
                    None => self.scheduler.delete_alarm(&self.partition),
                };
                if let Err(e) = applied {
                    tracing::error!("executor_alarm_sync_failed: partition={} error={}", self.partition, e);
                }
            }
            FromExecutor::WsBridge { payload } => self.bridge(payload),
            FromExecutor::Error { error } => {
                self.terminate(&error.to_string());
            }
        }
    }

    /// Apply a socket operation the executor performed on its end.
    fn bridge(&self, payload: BridgePayload) {
        let mut sockets = self.sockets();
        let result = match payload {
            BridgePayload::WsSend { socket_id, data } => match sockets.live.get(&socket_id) {
                Some(socket) => socket.send(data),
                None => Ok(()),
            },
            BridgePayload::WsClose {
                socket_id,
                code,
                reason,
            } => {
                sockets.accepted.remove(&socket_id);
                match sockets.live.remove(&socket_id) {
                    Some(socket) => socket.close(code, reason),
                    None => Ok(()),
                }
            }
            BridgePayload::WsAccept { socket_id, tags } => {
                tracing::debug!("executor_socket_accepted: socket={} tags={:?}", socket_id, tags);
                sockets.accepted.insert(socket_id);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::debug!("executor_bridge_failed: error={}", e);
        }
    }
}

/// An instance running on its own thread, reached over a framed channel.
///
/// Only plain data crosses the boundary: capabilities, functions and local
/// objects are rejected as arguments and return values.
pub struct IsolatedExecutor {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ToExecutor>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    init_timeout: Duration,
    last_active: Mutex<Instant>,
}

impl fmt::Debug for IsolatedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedExecutor")
            .field("partition", &self.shared.partition)
            .field("status", &self.status())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl IsolatedExecutor {
    /// Start the executor thread and the reader task. Must be called from
    /// inside a tokio runtime.
    pub fn spawn(spec: ExecutorSpec) -> Result<Arc<Self>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::internal("isolated executors need a tokio runtime"));
        }

        let (initiator_io, executor_io) = tokio::io::duplex(spec.config.pipe_capacity);
        let host_spec = HostSpec {
            id: spec.id.clone(),
            engine: spec.engine.clone(),
            factory: spec.factory,
            env: spec.env,
            max_frame_bytes: spec.config.max_frame_bytes,
        };
        std::thread::Builder::new()
            .name(format!("executor-{}", spec.class_name))
            .spawn(move || host::run_thread(executor_io, host_spec))?;

        let FramedEndpoint {
            outbound,
            mut inbound,
            reader: _,
            writer: _,
        } = framed::spawn::<_, FromExecutor, ToExecutor>(
            initiator_io,
            FrameConfig {
                inbound_kind: FRAME_FROM_EXECUTOR,
                outbound_kind: FRAME_TO_EXECUTOR,
                max_frame_bytes: spec.config.max_frame_bytes,
            },
        );

        let (status, _) = watch::channel(ExecutorStatus::Starting);
        let shared = Arc::new(Shared {
            init: InitConfig {
                class_name: spec.class_name.clone(),
                instance_id: spec.id.clone(),
            },
            partition: Partition::new(spec.class_name.clone(), spec.id.clone()),
            scheduler: spec.scheduler,
            pending: PendingTable::new(),
            status,
            sockets: Mutex::default(),
        });

        let reader_shared = shared.clone();
        let reader_outbound = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message {
                    Ok(message) => reader_shared.handle(message, &reader_outbound),
                    Err(e) => {
                        reader_shared.terminate(&format!("channel error: {}", e));
                        return;
                    }
                }
            }
            reader_shared.terminate("executor exited");
        });

        tracing::debug!("executor_spawned: namespace={} id={}", spec.class_name, spec.id);
        Ok(Arc::new(Self {
            shared,
            outbound: Mutex::new(Some(outbound)),
            reader: Mutex::new(Some(reader)),
            init_timeout: spec.config.init_timeout,
            last_active: Mutex::new(Instant::now()),
        }))
    }

    pub fn status(&self) -> ExecutorStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.status(), ExecutorStatus::Disposed(_))
    }

    /// Commands sent and not yet answered.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn socket_count(&self) -> usize {
        self.shared.sockets().live.len()
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.last_active.lock().unwrap_or_else(|p| p.into_inner());
        Instant::now().saturating_duration_since(last)
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn send(&self, envelope: ToExecutor) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| Error::executor_terminated("executor channel closed")),
            None => Err(Error::executor_terminated("executor disposed")),
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut status = self.shared.status.subscribe();
        let ready = async {
            loop {
                let current = status.borrow_and_update().clone();
                match current {
                    ExecutorStatus::Ready => return Ok(()),
                    ExecutorStatus::Disposed(reason) => return Err(Error::executor_terminated(reason)),
                    ExecutorStatus::Starting => {}
                }
                if status.changed().await.is_err() {
                    return Err(Error::executor_terminated("executor dropped"));
                }
            }
        };
        tokio::time::timeout(self.init_timeout, ready)
            .await
            .map_err(|_| Error::timeout(format!("executor not ready after {:?}", self.init_timeout)))?
    }

    /// Send one command and wait for its correlated result.
    async fn command(&self, command: Command) -> Result<CommandResult> {
        self.touch();
        self.wait_ready().await?;
        let kind = command.kind();
        let (id, rx) = self.shared.pending.register()?;
        if let Err(e) = self.send(ToExecutor::Command { id, command }) {
            self.shared.pending.forget(id);
            return Err(e);
        }
        tracing::trace!("executor_command_sent: id={} kind={}", id, kind);
        let result = pending::wait(rx).await;
        self.touch();
        result
    }

    pub async fn fetch(&self, mut request: FetchRequest) -> Result<FetchResponse> {
        let upgrade = request.socket.take();
        if let Some(socket) = &upgrade {
            let socket_id = socket.id().clone();
            self.shared.sockets().live.insert(socket_id.clone(), socket.clone());
            let created = self
                .command(Command::WsCreate {
                    socket_id: socket_id.clone(),
                })
                .await;
            if let Err(e) = created.and_then(|result| expect_kind(result, "ws-created")) {
                self.shared.sockets().live.remove(&socket_id);
                return Err(e);
            }
            request.socket_id = Some(socket_id);
        }

        let result = self.command(Command::Fetch { request }).await;

        if let Some(socket) = upgrade {
            // Not accepted by the handler: nothing keeps the socket.
            let mut sockets = self.shared.sockets();
            if !sockets.accepted.contains(socket.id()) {
                sockets.live.remove(socket.id());
            }
        }

        match result? {
            CommandResult::Fetch { response } => Ok(response),
            other => Err(unexpected(other, "fetch")),
        }
    }

    pub async fn alarm(&self, info: AlarmInfo) -> Result<()> {
        let result = self
            .command(Command::Alarm {
                retry_count: info.retry_count,
                is_retry: info.is_retry,
            })
            .await?;
        expect_kind(result, "alarm")
    }

    pub fn socket_message(&self, socket_id: &SocketId, message: SocketMessage) -> Result<()> {
        self.touch();
        self.send(ToExecutor::WsMessage {
            socket_id: socket_id.clone(),
            data: message,
        })
    }

    pub fn socket_close(&self, socket_id: &SocketId, code: u16, reason: String, was_clean: bool) -> Result<()> {
        {
            let mut sockets = self.shared.sockets();
            sockets.accepted.remove(socket_id);
            if let Some(socket) = sockets.live.remove(socket_id) {
                socket.mark_closed();
            }
        }
        self.touch();
        self.send(ToExecutor::WsClose {
            socket_id: socket_id.clone(),
            code,
            reason,
            was_clean,
        })
    }

    pub fn socket_error(&self, socket_id: &SocketId, error: String) -> Result<()> {
        self.touch();
        self.send(ToExecutor::WsError {
            socket_id: socket_id.clone(),
            error,
        })
    }

    /// Terminate the executor. Outstanding commands fail with
    /// `ExecutorTerminated`; the thread exits once it sees the channel close.
    pub fn dispose(&self) {
        self.shared.terminate("terminated");
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
    }
}

impl Drop for IsolatedExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn expect_kind(result: CommandResult, kind: &str) -> Result<()> {
    match (&result, kind) {
        (CommandResult::Alarm, "alarm") | (CommandResult::WsCreated { .. }, "ws-created") => Ok(()),
        _ => Err(unexpected(result, kind)),
    }
}

fn unexpected(result: CommandResult, expected: &str) -> Error {
    Error::internal(format!("expected a {} result, got {:?}", expected, result))
}

fn plain_arguments(args: Vec<RpcValue>) -> Result<Vec<serde_json::Value>> {
    args.into_iter()
        .enumerate()
        .map(|(idx, arg)| match arg {
            RpcValue::Value(value) => Ok(value),
            other => Err(Error::invalid_argument(format!(
                "argument {} is a {}; only plain data crosses an executor boundary",
                idx,
                other.kind()
            ))),
        })
        .collect()
}

#[async_trait]
impl Capability for IsolatedExecutor {
    async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        let args = plain_arguments(args)?;
        match self
            .command(Command::RpcCall {
                method: method.to_string(),
                args,
            })
            .await?
        {
            CommandResult::RpcCall { value } => Ok(RpcValue::Value(value)),
            other => Err(unexpected(other, "rpc-call")),
        }
    }

    async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
        match self
            .command(Command::RpcGet {
                property: property.to_string(),
            })
            .await?
        {
            CommandResult::RpcGet { value } => Ok(RpcValue::Value(value)),
            other => Err(unexpected(other, "rpc-get")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{factory, ActorState, DurableObject};
    use crate::rpc::arg;
    use crate::types::AlarmConfig;

    struct Counter {
        state: ActorState,
    }

    #[async_trait]
    impl Capability for Counter {
        async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
            match method {
                "increment" => {
                    let by: i64 = arg(&args, 0)?;
                    let current: i64 = self.state.storage().get("count").await?.unwrap_or(0);
                    self.state.storage().put("count", &(current + by)).await?;
                    Ok(RpcValue::from_json(&(current + by))?)
                }
                "boom" => Err(Error::actor("RangeError", "out of range")),
                "thread" => Ok(RpcValue::from_json(
                    &std::thread::current().name().unwrap_or("").to_string(),
                )?),
                _ => Err(Error::not_found(format!("method {}", method))),
            }
        }
    }

    impl DurableObject for Counter {}

    fn spec(engine: &StorageEngine) -> ExecutorSpec {
        ExecutorSpec {
            class_name: "Counter".to_string(),
            id: InstanceId::from_name("Counter", "a"),
            engine: engine.clone(),
            scheduler: AlarmScheduler::start(engine.clone(), AlarmConfig::default()),
            factory: factory(|state: ActorState, _env| Ok(Counter { state })),
            env: Env::new(),
            config: ExecutorConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_calls_run_on_executor_thread() {
        let engine = StorageEngine::in_memory().unwrap();
        let executor = IsolatedExecutor::spawn(spec(&engine)).unwrap();

        let value = executor
            .clone()
            .call("increment", vec![RpcValue::from_json(&5).unwrap()])
            .await
            .unwrap();
        assert_eq!(value.as_value(), Some(&serde_json::json!(5)));
        assert_eq!(executor.status(), ExecutorStatus::Ready);

        let thread = executor.clone().call("thread", vec![]).await.unwrap();
        assert_eq!(thread.as_value(), Some(&serde_json::json!("executor-Counter")));
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test]
    async fn test_actor_errors_keep_name_and_message() {
        let engine = StorageEngine::in_memory().unwrap();
        let executor = IsolatedExecutor::spawn(spec(&engine)).unwrap();

        let err = executor.clone().call("boom", vec![]).await.unwrap_err();
        assert_eq!(err.code(), "RangeError");
        assert!(err.to_string().contains("out of range"));

        let err = executor.clone().call("missing", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_non_plain_arguments_rejected() {
        let engine = StorageEngine::in_memory().unwrap();
        let executor = IsolatedExecutor::spawn(spec(&engine)).unwrap();

        let object = RpcValue::Object(crate::rpc::LocalObject::new(42u32));
        let err = executor.clone().call("increment", vec![object]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRpcArgument(_)));
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_later_commands() {
        let engine = StorageEngine::in_memory().unwrap();
        let executor = IsolatedExecutor::spawn(spec(&engine)).unwrap();
        executor
            .clone()
            .call("increment", vec![RpcValue::from_json(&1).unwrap()])
            .await
            .unwrap();

        executor.dispose();
        assert!(executor.is_disposed());
        let err = executor
            .clone()
            .call("increment", vec![RpcValue::from_json(&1).unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutorTerminated(_)));
    }
}
