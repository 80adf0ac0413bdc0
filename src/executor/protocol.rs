//! Envelopes exchanged between an initiator and its executor thread.
//!
//! Every envelope is a msgpack map with a `type` discriminator; commands
//! and results nest a second map discriminated by `kind`. Values that
//! cross the channel are plain data only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actor::{FetchRequest, FetchResponse};
use crate::sockets::SocketMessage;
use crate::types::{ErrorInfo, InstanceId, SocketId};

/// Which instance an executor hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    pub class_name: String,
    pub instance_id: InstanceId,
}

// =============================================================================
// Initiator -> executor
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ToExecutor {
    /// Answer to [`FromExecutor::NeedInit`].
    Init { config: InitConfig },
    /// A correlated request; answered by [`FromExecutor::Result`] with the same id.
    Command { id: u64, command: Command },
    WsMessage {
        socket_id: SocketId,
        data: SocketMessage,
    },
    WsClose {
        socket_id: SocketId,
        code: u16,
        reason: String,
        was_clean: bool,
    },
    WsError { socket_id: SocketId, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Command {
    Fetch { request: FetchRequest },
    RpcCall {
        method: String,
        args: Vec<serde_json::Value>,
    },
    RpcGet { property: String },
    Alarm { retry_count: u32, is_retry: bool },
    /// Create the executor-side end of a socket before a fetch that upgrades it.
    WsCreate { socket_id: SocketId },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::RpcCall { .. } => "rpc-call",
            Self::RpcGet { .. } => "rpc-get",
            Self::Alarm { .. } => "alarm",
            Self::WsCreate { .. } => "ws-create",
        }
    }
}

// =============================================================================
// Executor -> initiator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FromExecutor {
    /// First envelope from a fresh executor.
    NeedInit,
    /// The instance is constructed; commands may flow.
    Ready,
    Result { id: u64, result: CommandResult },
    /// The instance set (`Some`) or cleared (`None`) its alarm. The row is
    /// already persisted; the initiator arms or disarms the scheduler.
    AlarmSet { time: Option<DateTime<Utc>> },
    /// A socket operation the initiator performs on the real connection.
    WsBridge { payload: BridgePayload },
    /// The executor cannot continue. Every pending command fails.
    Error { error: ErrorInfo },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CommandResult {
    Fetch { response: FetchResponse },
    RpcCall { value: serde_json::Value },
    RpcGet { value: serde_json::Value },
    Alarm,
    WsCreated { socket_id: SocketId },
    Error { error: ErrorInfo },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BridgePayload {
    WsSend {
        socket_id: SocketId,
        data: SocketMessage,
    },
    WsClose {
        socket_id: SocketId,
        code: u16,
        reason: String,
    },
    WsAccept {
        socket_id: SocketId,
        tags: Vec<String>,
    },
}
