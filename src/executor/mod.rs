//! Isolated-thread executors.
//!
//! An isolated namespace runs each instance on its own OS thread with a
//! private current-thread runtime. The namespace side ([`IsolatedExecutor`])
//! and the thread side talk over an in-memory duplex pipe carrying
//! length-prefixed msgpack envelopes (see [`protocol`]).
//!
//! Handshake: the executor sends `need-init`, the initiator answers `init`,
//! the executor constructs the instance and sends `ready`. Commands sent
//! before `ready` wait for it.

mod host;
mod initiator;
pub mod protocol;

pub use initiator::{ExecutorSpec, ExecutorStatus, IsolatedExecutor};
