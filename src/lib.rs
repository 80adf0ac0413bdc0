//! # Durable Core - local durable-actor runtime
//!
//! Rust implementation of a durable object runtime providing:
//! - Namespaces mapping ids (derived, raw or random) to single live instances
//! - A start-up barrier that queues calls until async initialization settles
//! - Persistent per-instance key/value storage with transactions and range listing
//! - One durable alarm per instance with exponential-backoff retries
//! - Hibernatable sockets with tags and auto-replies
//! - Capability RPC stubs with promise pipelining
//! - Optional isolation of every instance on its own executor thread
//!
//! ## Architecture
//!
//! ```text
//!                     ┌───────────────────────────────────────┐
//!   stub.call() ───→  │  Namespace                            │
//!   fetch() ───────→  │   id → Instance ─┬─ Local(ActorHandle)│
//!   socket events ─→  │                  └─ Isolated(executor)│──→ executor thread
//!                     │         │  InitBarrier                │    (framed msgpack)
//!                     └─────────┼─────────────────────────────┘
//!                               ▼
//!               StorageEngine (SQLite)  ←──  AlarmScheduler
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod actor;
pub mod alarms;
pub mod channel;
pub mod executor;
pub mod rpc;
pub mod runtime;
pub mod sockets;
pub mod storage;
pub mod types;

// Internal utilities
pub mod observability;

pub use actor::{
    factory, ActorState, DurableObject, Env, FetchRequest, FetchResponse, Namespace, NamespaceOptions,
};
pub use alarms::AlarmInfo;
pub use rpc::{Capability, Pending, RpcValue, Stub};
pub use runtime::Runtime;
pub use sockets::{HibernatableSocket, SocketMessage};
pub use types::{Config, Error, InstanceId, Result};
