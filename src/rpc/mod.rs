//! Capability-based RPC.
//!
//! A [`Capability`] is an object explicitly marked as remotely callable.
//! Crossing the boundary turns it into a [`Stub`] obtained from a
//! [`HandleTable`], so the same target always maps to the same stub.
//! Calls return a [`Pending`] that can be awaited or pipelined.

mod pending;
mod stub;
mod table;
mod value;

pub use pending::Pending;
pub use stub::Stub;
pub use table::HandleTable;
pub use value::{arg, LocalObject, RpcFunction, RpcValue};

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::{Error, Result};

/// An object whose members can be invoked through a stub.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    /// Invoke `method`. Unknown methods should fail with `NotFound`.
    async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue>;

    /// Read `property`.
    async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
        Err(Error::not_found(format!("property {}", property)))
    }

    /// `Some` when this capability is itself a stub.
    fn as_stub(self: Arc<Self>) -> Option<Stub> {
        None
    }
}
