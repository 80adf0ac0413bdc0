//! Executor side: hosts one instance on a dedicated thread.
//!
//! The host announces itself with `NeedInit`, builds the instance when the
//! initiator answers with `Init`, reports `Ready` and then serves commands.
//! Each command runs as its own task so long calls do not block the
//! channel; socket events for one socket are delivered in order by a
//! per-socket task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::protocol::{Command, CommandResult, FromExecutor, InitConfig, ToExecutor};
use crate::actor::{ActorHandle, Env, ObjectFactory};
use crate::alarms::AlarmInfo;
use crate::channel::codec::{FRAME_FROM_EXECUTOR, FRAME_TO_EXECUTOR};
use crate::channel::framed::{self, FrameConfig, FramedEndpoint};
use crate::rpc::{Capability, RpcValue};
use crate::sockets::{HibernatableSocket, SocketMessage};
use crate::storage::{ActorStorage, AlarmControl, Partition, StorageEngine};
use crate::types::{Error, InstanceId, Result, SocketId};

/// What the executor thread needs to construct its instance.
pub(crate) struct HostSpec {
    pub id: InstanceId,
    pub engine: StorageEngine,
    pub factory: ObjectFactory,
    pub env: Env,
    pub max_frame_bytes: u32,
}

type CreatedSockets = Arc<Mutex<HashMap<SocketId, HibernatableSocket>>>;

#[derive(Debug)]
enum SocketEvent {
    Message(SocketMessage),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
}

/// Thread entry point: run the host on a private current-thread runtime
/// until the initiator hangs up.
pub(crate) fn run_thread(stream: DuplexStream, spec: HostSpec) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // Dropping the stream shows up as EOF on the initiator.
            tracing::error!("executor_runtime_failed: error={}", e);
            return;
        }
    };
    let id = spec.id.clone();
    runtime.block_on(serve(stream, spec));
    tracing::debug!("executor_thread_exited: id={}", id);
}

async fn serve(stream: DuplexStream, spec: HostSpec) {
    let FramedEndpoint {
        outbound,
        mut inbound,
        reader,
        writer,
    } = framed::spawn::<_, ToExecutor, FromExecutor>(
        stream,
        FrameConfig {
            inbound_kind: FRAME_TO_EXECUTOR,
            outbound_kind: FRAME_FROM_EXECUTOR,
            max_frame_bytes: spec.max_frame_bytes,
        },
    );

    if outbound.send(FromExecutor::NeedInit).is_err() {
        return;
    }

    let config = loop {
        match inbound.recv().await {
            Some(Ok(ToExecutor::Init { config })) => break config,
            Some(Ok(other)) => {
                tracing::warn!("executor_message_before_init: message={:?}", other);
            }
            Some(Err(e)) => {
                tracing::error!("executor_channel_error: error={}", e);
                return;
            }
            None => return,
        }
    };

    let handle = match build_handle(&spec, &config, outbound.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(
                "executor_init_failed: namespace={} id={} error={}",
                config.class_name,
                config.instance_id,
                e
            );
            let _ = outbound.send(FromExecutor::Error { error: e.to_info() });
            drop(outbound);
            let _ = writer.await;
            reader.abort();
            return;
        }
    };
    if outbound.send(FromExecutor::Ready).is_err() {
        return;
    }
    tracing::debug!(
        "executor_ready: namespace={} id={}",
        config.class_name,
        config.instance_id
    );

    let created: CreatedSockets = Arc::default();
    let mut socket_tasks: HashMap<SocketId, mpsc::UnboundedSender<SocketEvent>> = HashMap::new();

    while let Some(message) = inbound.recv().await {
        match message {
            Ok(ToExecutor::Command { id, command }) => {
                // Created inline so the fetch that follows always finds it.
                if let Command::WsCreate { socket_id } = &command {
                    let socket = HibernatableSocket::bridged(socket_id.clone(), outbound.clone());
                    lock(&created).insert(socket_id.clone(), socket);
                }
                let handle = handle.clone();
                let created = created.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let result = run_command(handle, command, &created).await;
                    let _ = outbound.send(FromExecutor::Result { id, result });
                });
            }
            Ok(ToExecutor::WsMessage { socket_id, data }) => {
                route(&mut socket_tasks, &handle, socket_id, SocketEvent::Message(data));
            }
            Ok(ToExecutor::WsClose {
                socket_id,
                code,
                reason,
                was_clean,
            }) => {
                route(
                    &mut socket_tasks,
                    &handle,
                    socket_id.clone(),
                    SocketEvent::Close {
                        code,
                        reason,
                        was_clean,
                    },
                );
                socket_tasks.remove(&socket_id);
                lock(&created).remove(&socket_id);
            }
            Ok(ToExecutor::WsError { socket_id, error }) => {
                route(&mut socket_tasks, &handle, socket_id, SocketEvent::Error(error));
            }
            Ok(ToExecutor::Init { .. }) => {
                tracing::warn!("executor_duplicate_init: id={}", config.instance_id);
            }
            Err(e) => {
                tracing::error!("executor_channel_error: error={}", e);
                let _ = outbound.send(FromExecutor::Error { error: e.to_info() });
                break;
            }
        }
    }

    reader.abort();
}

fn build_handle(
    spec: &HostSpec,
    config: &InitConfig,
    outbound: mpsc::UnboundedSender<FromExecutor>,
) -> Result<Arc<ActorHandle>> {
    if config.instance_id != spec.id {
        return Err(Error::internal(format!(
            "init for {} sent to the executor of {}",
            config.instance_id, spec.id
        )));
    }
    let partition = Partition::new(config.class_name.clone(), config.instance_id.clone());
    let storage = ActorStorage::new(partition, spec.engine.clone(), AlarmControl::Bridged(outbound));
    ActorHandle::create(
        &config.class_name,
        config.instance_id.clone(),
        storage,
        &spec.factory,
        spec.env.clone(),
    )
}

async fn run_command(handle: Arc<ActorHandle>, command: Command, created: &CreatedSockets) -> CommandResult {
    let outcome = match command {
        Command::Fetch { mut request } => {
            if let Some(socket_id) = &request.socket_id {
                request.socket = lock(created).remove(socket_id);
            }
            handle
                .fetch(request)
                .await
                .map(|response| CommandResult::Fetch { response })
        }
        Command::RpcCall { method, args } => {
            let args = args.into_iter().map(RpcValue::Value).collect();
            handle
                .call(&method, args)
                .await
                .and_then(plain_value)
                .map(|value| CommandResult::RpcCall { value })
        }
        Command::RpcGet { property } => handle
            .get(&property)
            .await
            .and_then(plain_value)
            .map(|value| CommandResult::RpcGet { value }),
        Command::Alarm {
            retry_count,
            is_retry,
        } => handle
            .alarm(AlarmInfo {
                retry_count,
                is_retry,
            })
            .await
            .map(|()| CommandResult::Alarm),
        Command::WsCreate { socket_id } => Ok(CommandResult::WsCreated { socket_id }),
    };
    outcome.unwrap_or_else(|e| CommandResult::Error { error: e.to_info() })
}

/// Only plain data crosses the thread boundary.
fn plain_value(value: RpcValue) -> Result<serde_json::Value> {
    match value {
        RpcValue::Value(value) => Ok(value),
        other => Err(Error::invalid_return_value(format!(
            "a {} cannot be returned across an executor boundary",
            other.kind()
        ))),
    }
}

fn route(
    tasks: &mut HashMap<SocketId, mpsc::UnboundedSender<SocketEvent>>,
    handle: &Arc<ActorHandle>,
    socket_id: SocketId,
    event: SocketEvent,
) {
    let tx = tasks
        .entry(socket_id.clone())
        .or_insert_with(|| spawn_socket_task(handle.clone(), socket_id));
    if tx.send(event).is_err() {
        tracing::debug!("socket_event_dropped: reason=task_gone");
    }
}

fn spawn_socket_task(handle: Arc<ActorHandle>, socket_id: SocketId) -> mpsc::UnboundedSender<SocketEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let closing = matches!(event, SocketEvent::Close { .. });
            let result = match event {
                SocketEvent::Message(message) => handle.socket_message(&socket_id, message).await,
                SocketEvent::Close {
                    code,
                    reason,
                    was_clean,
                } => handle.socket_close(&socket_id, code, reason, was_clean).await,
                SocketEvent::Error(error) => handle.socket_error(&socket_id, error).await,
            };
            if let Err(e) = result {
                tracing::warn!("socket_handler_failed: socket={} error={}", socket_id, e);
            }
            if closing {
                break;
            }
        }
    });
    tx
}

fn lock(created: &CreatedSockets) -> std::sync::MutexGuard<'_, HashMap<SocketId, HibernatableSocket>> {
    created.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
