//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Name/message/stack triple carried across the executor channel and used for
/// errors raised inside actor method bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Main error enum for the durable actor runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input from a caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown method, property, socket or row.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),

    /// Deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Namespace used before a behavior class was bound.
    #[error("namespace {0} has no bound class")]
    BindingNotWired(String),

    /// A second startup task was registered while one is still outstanding.
    #[error("instance {0} is already initializing")]
    AlreadyInitializing(String),

    /// A non-capability object with identity was passed as an RPC argument.
    #[error("invalid rpc argument: {0}")]
    InvalidRpcArgument(String),

    /// A non-capability object with identity was returned from an RPC call.
    #[error("invalid rpc return value: {0}")]
    InvalidRpcReturnValue(String),

    /// The executor was disposed or failed; no further commands are accepted.
    #[error("executor terminated: {0}")]
    ExecutorTerminated(String),

    /// An alarm handler returned an error. Triggers a retry, never reaches a caller.
    #[error("alarm handler failed (retry {retry_count}): {source}")]
    AlarmHandlerFailed {
        retry_count: u32,
        #[source]
        source: Box<Error>,
    },

    /// Error raised by an actor method body.
    #[error("{0}")]
    Actor(ErrorInfo),

    /// Storage engine errors.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Executor channel encode/decode errors.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error name, used as `name` on the executor channel.
    pub fn code(&self) -> &str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::Internal(_) => "InternalError",
            Error::Timeout(_) => "Timeout",
            Error::BindingNotWired(_) => "BindingNotWired",
            Error::AlreadyInitializing(_) => "AlreadyInitializing",
            Error::InvalidRpcArgument(_) => "InvalidRpcArgument",
            Error::InvalidRpcReturnValue(_) => "InvalidRpcReturnValue",
            Error::ExecutorTerminated(_) => "ExecutorTerminated",
            Error::AlarmHandlerFailed { .. } => "AlarmHandlerFailed",
            Error::Actor(info) => &info.name,
            Error::Storage(_) => "StorageError",
            Error::Serialization(_) => "SerializationError",
            Error::Codec(_) => "CodecError",
            Error::Io(_) => "IoError",
        }
    }

    /// Flatten into the wire triple.
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            Error::Actor(info) => info.clone(),
            Error::Validation(msg)
            | Error::NotFound(msg)
            | Error::Internal(msg)
            | Error::Timeout(msg)
            | Error::BindingNotWired(msg)
            | Error::AlreadyInitializing(msg)
            | Error::InvalidRpcArgument(msg)
            | Error::InvalidRpcReturnValue(msg)
            | Error::ExecutorTerminated(msg)
            | Error::Codec(msg) => ErrorInfo::new(self.code(), msg.clone()),
            other => ErrorInfo::new(other.code(), other.to_string()),
        }
    }

    /// Rebuild an error received over the executor channel.
    ///
    /// Names from the runtime's own taxonomy map back to their variants;
    /// anything else is treated as an error thrown by actor code.
    pub fn from_info(info: ErrorInfo) -> Self {
        let message = info.message.clone();
        match info.name.as_str() {
            "ValidationError" => Error::Validation(message),
            "NotFound" => Error::NotFound(message),
            "InternalError" => Error::Internal(message),
            "Timeout" => Error::Timeout(message),
            "BindingNotWired" => Error::BindingNotWired(message),
            "AlreadyInitializing" => Error::AlreadyInitializing(message),
            "InvalidRpcArgument" => Error::InvalidRpcArgument(message),
            "InvalidRpcReturnValue" => Error::InvalidRpcReturnValue(message),
            "ExecutorTerminated" => Error::ExecutorTerminated(message),
            "CodecError" => Error::Codec(message),
            _ => Error::Actor(info),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidRpcArgument(msg.into())
    }

    pub fn invalid_return_value(msg: impl Into<String>) -> Self {
        Self::InvalidRpcReturnValue(msg.into())
    }

    pub fn executor_terminated(msg: impl Into<String>) -> Self {
        Self::ExecutorTerminated(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Error thrown from actor code, e.g. `Error::actor("RangeError", "count must be positive")`.
    pub fn actor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Actor(ErrorInfo::new(name, message))
    }
}
