//! Typed request/response channel plumbing.
//!
//! Length-prefixed msgpack frames over any `AsyncRead + AsyncWrite` stream,
//! plus a correlation-id table for in-flight requests. The isolated-thread
//! executor is built on these; nothing here knows about actors.

pub mod codec;
pub mod framed;
pub mod pending;

pub use framed::{FrameConfig, FramedEndpoint};
pub use pending::PendingTable;
