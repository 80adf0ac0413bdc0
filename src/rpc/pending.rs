//! Pending results that support pipelining.

use futures::future::BoxFuture;
use std::fmt;
use std::future::{Future, IntoFuture};

use super::{RpcValue, Stub};
use crate::types::Result;

/// A result that has not arrived yet.
///
/// Awaiting it yields the underlying result. `call` and `get` chain one more
/// hop onto the eventual capability without an intermediate await.
#[must_use = "a pending result does nothing unless awaited"]
pub struct Pending {
    inner: BoxFuture<'static, Result<RpcValue>>,
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl Pending {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    pub fn ready(result: Result<RpcValue>) -> Self {
        Self::new(futures::future::ready(result))
    }

    /// Await the result and treat it as a capability.
    pub async fn stub(self) -> Result<Stub> {
        self.await?.into_stub()
    }

    pub fn call(self, method: impl Into<String>, args: Vec<RpcValue>) -> Pending {
        let method = method.into();
        Pending::new(async move { self.stub().await?.call(method, args).await })
    }

    pub fn get(self, property: impl Into<String>) -> Pending {
        let property = property.into();
        Pending::new(async move { self.stub().await?.get(property).await })
    }

    /// Resolves to a distinct stub over the eventual capability.
    pub fn dup(self) -> Pending {
        Pending::new(async move { Ok(self.stub().await?.dup().into_value()) })
    }
}

impl IntoFuture for Pending {
    type Output = Result<RpcValue>;
    type IntoFuture = BoxFuture<'static, Result<RpcValue>>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}
