//! Capability stubs.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};

use super::{Capability, HandleTable, Pending, RpcValue};
use crate::types::{Error, Result};

pub(crate) struct StubInner {
    target: Arc<dyn Capability>,
    table: HandleTable,
    handle: u64,
}

/// Remotely-callable view of a capability.
///
/// Every call validates its arguments, dispatches to the target and wraps
/// the result. Members whose name starts with `_` are unreachable.
#[derive(Clone)]
pub struct Stub(Arc<StubInner>);

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub").field("handle", &self.0.handle).finish()
    }
}

impl Stub {
    pub(crate) fn new_in(table: HandleTable, target: Arc<dyn Capability>, handle: u64) -> Self {
        Self(Arc::new(StubInner {
            target,
            table,
            handle,
        }))
    }

    pub(crate) fn from_inner(inner: Arc<StubInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<StubInner> {
        Arc::downgrade(&self.0)
    }

    /// Call `method` with `args`.
    pub fn call(&self, method: impl Into<String>, args: Vec<RpcValue>) -> Pending {
        let inner = self.0.clone();
        let method = method.into();
        Pending::new(async move { dispatch_call(inner, method, args).await })
    }

    /// Read `property`.
    pub fn get(&self, property: impl Into<String>) -> Pending {
        let inner = self.0.clone();
        let property = property.into();
        Pending::new(async move { dispatch_get(inner, property).await })
    }

    /// A distinct stub over the same target, not shared through the cache.
    pub fn dup(&self) -> Stub {
        Stub::new_in(
            self.0.table.clone(),
            self.0.target.clone(),
            self.0.table.next_handle(),
        )
    }

    /// No-op; the target is not reference counted through its stubs.
    pub fn dispose(&self) {}

    pub fn handle(&self) -> u64 {
        self.0.handle
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Stub) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn into_capability(self) -> Arc<dyn Capability> {
        self.0
    }

    pub fn into_value(self) -> RpcValue {
        RpcValue::Capability(self.0)
    }
}

fn check_visible(name: &str) -> Result<()> {
    if name.starts_with('_') {
        return Err(Error::not_found(format!("member {} is not accessible", name)));
    }
    Ok(())
}

async fn dispatch_call(inner: Arc<StubInner>, method: String, args: Vec<RpcValue>) -> Result<RpcValue> {
    check_visible(&method)?;
    let args = inner.table.wrap_arguments(args)?;
    let result = inner.target.clone().call(&method, args).await?;
    inner.table.wrap_return(result)
}

async fn dispatch_get(inner: Arc<StubInner>, property: String) -> Result<RpcValue> {
    check_visible(&property)?;
    let value = inner.target.clone().get(&property).await?;
    inner.table.wrap_return(value)
}

#[async_trait]
impl Capability for StubInner {
    async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        dispatch_call(self, method.to_string(), args).await
    }

    async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
        dispatch_get(self, property.to_string()).await
    }

    fn as_stub(self: Arc<Self>) -> Option<Stub> {
        Some(Stub(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{arg, LocalObject, RpcFunction};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tree node: `child()` returns a fresh node, `self_ref()` returns itself.
    struct Node {
        depth: u64,
        secret_calls: AtomicUsize,
    }

    impl Node {
        fn new(depth: u64) -> Arc<Self> {
            Arc::new(Self {
                depth,
                secret_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Capability for Node {
        async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
            match method {
                "depth" => Ok(json!(self.depth).into()),
                "child" => Ok(RpcValue::Capability(Node::new(self.depth + 1))),
                "self_ref" => Ok(RpcValue::Capability(self)),
                "add" => {
                    let a: i64 = arg(&args, 0)?;
                    let b: i64 = arg(&args, 1)?;
                    Ok(json!(a + b).into())
                }
                "apply" => {
                    let function = args.into_iter().next().unwrap_or_else(RpcValue::null).into_function()?;
                    function.invoke(vec![json!(self.depth).into()]).await
                }
                "leak" => Ok(RpcValue::Object(LocalObject::new(std::sync::Mutex::new(0)))),
                "_secret" => {
                    self.secret_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(RpcValue::null())
                }
                other => Err(Error::not_found(format!("method {}", other))),
            }
        }

        async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
            match property {
                "depth" => Ok(json!(self.depth).into()),
                "_hidden" => Ok(json!("visible?").into()),
                other => Err(Error::not_found(format!("property {}", other))),
            }
        }
    }

    fn depth_of(value: RpcValue) -> u64 {
        value.into_json().unwrap()
    }

    #[tokio::test]
    async fn test_call_and_get() {
        let table = HandleTable::new();
        let stub = table.wrap(Node::new(0));

        let sum = stub.call("add", vec![json!(2).into(), json!(3).into()]).await.unwrap();
        assert_eq!(sum.as_value(), Some(&json!(5)));
        assert_eq!(depth_of(stub.get("depth").await.unwrap()), 0);
        assert!(matches!(
            stub.call("missing", vec![]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_underscore_members_unreachable() {
        let table = HandleTable::new();
        let node = Node::new(0);
        let stub = table.wrap(node.clone());

        assert!(matches!(stub.call("_secret", vec![]).await, Err(Error::NotFound(_))));
        assert!(matches!(stub.get("_hidden").await, Err(Error::NotFound(_))));
        assert!(matches!(
            stub.call("child", vec![]).call("_secret", vec![]).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(node.secret_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_self_reference_returns_held_stub() {
        let table = HandleTable::new();
        let stub = table.wrap(Node::new(0));

        let returned = stub.call("self_ref", vec![]).await.unwrap().into_stub().unwrap();
        assert!(returned.ptr_eq(&stub));
    }

    #[tokio::test]
    async fn test_dup_is_distinct_but_equivalent() {
        let table = HandleTable::new();
        let stub = table.wrap(Node::new(4));
        let dup = stub.dup();

        assert!(!dup.ptr_eq(&stub));
        assert_ne!(dup.handle(), stub.handle());
        assert_eq!(depth_of(dup.get("depth").await.unwrap()), 4);
        dup.dispose();
        assert_eq!(depth_of(stub.call("depth", vec![]).await.unwrap()), 4);
    }

    #[tokio::test]
    async fn test_pipelining_matches_stepwise() {
        let table = HandleTable::new();
        let root = table.wrap(Node::new(0));

        let piped = root.call("child", vec![]).call("child", vec![]).call("depth", vec![]).await.unwrap();

        let child = root.call("child", vec![]).await.unwrap().into_stub().unwrap();
        let grandchild = child.call("child", vec![]).await.unwrap().into_stub().unwrap();
        let stepwise = grandchild.call("depth", vec![]).await.unwrap();

        assert_eq!(depth_of(piped), depth_of(stepwise));
        assert_eq!(depth_of(root.call("child", vec![]).get("depth").await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let table = HandleTable::new();
        let stub = table.wrap(Node::new(0));

        let object = RpcValue::Object(LocalObject::new(String::from("identity")));
        assert!(matches!(
            stub.call("add", vec![object]).await,
            Err(Error::InvalidRpcArgument(_))
        ));
        assert!(matches!(
            stub.call("leak", vec![]).await,
            Err(Error::InvalidRpcReturnValue(_))
        ));
    }

    #[tokio::test]
    async fn test_functions_pass_as_stubs() {
        let table = HandleTable::new();
        let stub = table.wrap(Node::new(7));
        let callback = RpcFunction::new(|args| async move {
            let depth: u64 = arg(&args, 0)?;
            Ok(json!(depth * 10).into())
        });

        let result = stub.call("apply", vec![callback.into()]).await.unwrap();
        assert_eq!(depth_of(result), 70);
    }
}
