//! Values that cross the RPC boundary.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{Capability, HandleTable, Pending, Stub};
use crate::types::{Error, Result};

/// A value passed to or returned from a capability member.
///
/// The variant is chosen by whoever produces the value: plain data travels
/// by value, capabilities and functions travel as stubs, and anything else
/// with identity (`Object`) is refused at the boundary.
#[derive(Clone)]
pub enum RpcValue {
    Value(serde_json::Value),
    Capability(Arc<dyn Capability>),
    Function(RpcFunction),
    Object(LocalObject),
}

impl RpcValue {
    pub fn null() -> Self {
        Self::Value(serde_json::Value::Null)
    }

    /// Plain data from anything serializable.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Capability(_) => "capability",
            Self::Function(_) => "function",
            Self::Object(_) => "object",
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Deserialize plain data; any other variant is a validation error.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Value(value) => Ok(serde_json::from_value(value)?),
            other => Err(Error::validation(format!(
                "expected plain data, got a {}",
                other.kind()
            ))),
        }
    }

    /// Stub for a capability value. Capabilities not yet wrapped go through
    /// the process-wide table.
    pub fn into_stub(self) -> Result<Stub> {
        match self {
            Self::Capability(target) => Ok(HandleTable::global().wrap(target)),
            other => Err(Error::validation(format!(
                "expected a capability, got a {}",
                other.kind()
            ))),
        }
    }

    pub fn into_function(self) -> Result<RpcFunction> {
        match self {
            Self::Function(function) => Ok(function),
            other => Err(Error::validation(format!(
                "expected a function, got a {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Capability(_) => f.write_str("Capability(..)"),
            Self::Function(function) => function.fmt(f),
            Self::Object(object) => object.fmt(f),
        }
    }
}

impl From<serde_json::Value> for RpcValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl From<Stub> for RpcValue {
    fn from(stub: Stub) -> Self {
        stub.into_value()
    }
}

impl From<RpcFunction> for RpcValue {
    fn from(function: RpcFunction) -> Self {
        Self::Function(function)
    }
}

/// Deserialize argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[RpcValue], index: usize) -> Result<T> {
    match args.get(index) {
        Some(value) => value.clone().into_json(),
        None => Err(Error::validation(format!("missing argument {}", index))),
    }
}

type FunctionBody = dyn Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync;

/// A callable passed by reference.
#[derive(Clone)]
pub struct RpcFunction {
    body: Arc<FunctionBody>,
    stubbed: bool,
}

impl RpcFunction {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        Self {
            body: Arc::new(move |args: Vec<RpcValue>| -> BoxFuture<'static, Result<RpcValue>> {
                Box::pin(f(args))
            }),
            stubbed: false,
        }
    }

    pub fn invoke(&self, args: Vec<RpcValue>) -> Pending {
        Pending::new((self.body)(args))
    }

    /// Whether this function already validates and wraps at the boundary.
    pub fn is_stub(&self) -> bool {
        self.stubbed
    }

    /// Function stub: arguments are validated and results wrapped by `table`.
    pub(crate) fn stubbed(self, table: &HandleTable) -> Self {
        if self.stubbed {
            return self;
        }
        let body = self.body;
        let table = table.clone();
        Self {
            body: Arc::new(move |args: Vec<RpcValue>| -> BoxFuture<'static, Result<RpcValue>> {
                let body = body.clone();
                let table = table.clone();
                Box::pin(async move {
                    let args = table.wrap_arguments(args)?;
                    let result = body(args).await?;
                    table.wrap_return(result)
                })
            }),
            stubbed: true,
        }
    }
}

impl fmt::Debug for RpcFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcFunction")
            .field("stubbed", &self.stubbed)
            .finish_non_exhaustive()
    }
}

/// An in-process object with identity that is neither plain data nor a
/// capability. It can be held locally but never crosses the boundary.
#[derive(Clone)]
pub struct LocalObject {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl LocalObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalObject({})", self.type_name)
    }
}
