//! Executor integration tests: the same actor behavior running on isolated
//! executor threads, reached through the framed channel.
//!
//! These run on real time; the executor thread has its own clock.

use async_trait::async_trait;
use chrono::Utc;
use durable_core::actor::{
    factory, ActorState, DurableObject, Env, FetchRequest, FetchResponse, Instance, NamespaceOptions,
};
use durable_core::alarms::AlarmInfo;
use durable_core::rpc::{arg, Capability, LocalObject, RpcValue};
use durable_core::sockets::{AutoResponse, HibernatableSocket, OutboundFrame, SocketMessage};
use durable_core::storage::Partition;
use durable_core::types::{AlarmConfig, Config, Error, Result, StorageConfig};
use durable_core::{Namespace, Runtime};
use serde_json::json;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

/// Keeps its log in storage so the initiator can read it over RPC.
struct Journal {
    state: ActorState,
}

impl Journal {
    async fn append(&self, entry: String) -> Result<()> {
        let storage = self.state.storage();
        let mut log: Vec<String> = storage.get("log").await?.unwrap_or_default();
        log.push(entry);
        storage.put("log", &log).await
    }
}

#[async_trait]
impl Capability for Journal {
    async fn call(self: Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        let storage = self.state.storage();
        match method {
            "increment" => {
                let next = storage.get::<i64>("count").await?.unwrap_or(0) + 1;
                storage.put("count", &next).await?;
                RpcValue::from_json(&next)
            }
            "log" => RpcValue::from_json(&storage.get::<Vec<String>>("log").await?.unwrap_or_default()),
            "append" => {
                let entry: String = arg(&args, 0)?;
                self.append(entry).await?;
                Ok(RpcValue::null())
            }
            "sleep" => {
                let millis: u64 = arg(&args, 0)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                RpcValue::from_json(&millis)
            }
            "scheduleIn" => {
                let millis: i64 = arg(&args, 0)?;
                storage
                    .set_alarm(Utc::now() + chrono::Duration::milliseconds(millis))
                    .await?;
                Ok(RpcValue::null())
            }
            "fail" => Err(Error::actor("TypeError", "bad input")),
            "autoReply" => {
                self.state
                    .set_auto_response(Some(AutoResponse::new("ping", "pong")));
                Ok(RpcValue::null())
            }
            "me" => Ok(RpcValue::Capability(self)),
            other => Err(Error::not_found(format!("method {}", other))),
        }
    }

    async fn get(self: Arc<Self>, property: &str) -> Result<RpcValue> {
        match property {
            "thread" => RpcValue::from_json(&std::thread::current().name().map(str::to_string)),
            other => Err(Error::not_found(format!("property {}", other))),
        }
    }
}

#[async_trait]
impl DurableObject for Journal {
    async fn fetch(self: Arc<Self>, request: FetchRequest) -> Result<FetchResponse> {
        match request.socket.clone() {
            Some(socket) => {
                self.state.accept_socket(socket.clone(), vec!["room:a".to_string()])?;
                socket.send("welcome")?;
                Ok(FetchResponse::switching_protocols())
            }
            None => Ok(FetchResponse::ok(request.method.clone())),
        }
    }

    async fn alarm(self: Arc<Self>, info: AlarmInfo) -> Result<()> {
        self.append(format!("alarm:{}:{}", info.retry_count, info.is_retry))
            .await?;
        if info.retry_count == 0 {
            return Err(Error::actor("Error", "first attempt fails"));
        }
        Ok(())
    }

    async fn socket_message(
        self: Arc<Self>,
        socket: HibernatableSocket,
        message: SocketMessage,
    ) -> Result<()> {
        let text = message.as_text().unwrap_or("<binary>").to_string();
        self.append(format!("message:{}", text)).await?;
        socket.send(format!("echo:{}", text).as_str())
    }

    async fn socket_close(
        self: Arc<Self>,
        _socket: HibernatableSocket,
        code: u16,
        _reason: String,
        _was_clean: bool,
    ) -> Result<()> {
        self.append(format!("close:{}", code)).await
    }

    async fn socket_error(self: Arc<Self>, _socket: HibernatableSocket, error: String) -> Result<()> {
        self.append(format!("error:{}", error)).await
    }
}

fn runtime() -> Runtime {
    runtime_with(StorageConfig::default())
}

fn runtime_with(storage: StorageConfig) -> Runtime {
    Runtime::new(Config {
        storage,
        alarms: AlarmConfig {
            retry_base_delay: Duration::from_millis(50),
            ..AlarmConfig::default()
        },
        ..Config::default()
    })
    .unwrap()
}

fn journal(runtime: &Runtime) -> Namespace {
    let ns = runtime.namespace("Journal", NamespaceOptions::isolated());
    ns.bind(factory(|state: ActorState, _env: Env| Ok(Journal { state })))
        .unwrap();
    ns
}

async fn read_log(ns: &Namespace, name: &str) -> Vec<String> {
    ns.get_by_name(name)
        .unwrap()
        .call("log", vec![])
        .await
        .unwrap()
        .into_json()
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn test_calls_run_on_executor_thread() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let stub = ns.get_by_name("a").unwrap();

    let thread = stub.get("thread").await.unwrap();
    assert_eq!(thread.as_value(), Some(&json!("executor-Journal")));

    stub.call("increment", vec![]).await.unwrap();
    let count = ns.get_by_name("a").unwrap().call("increment", vec![]).await.unwrap();
    assert_eq!(count.as_value(), Some(&json!(2)));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_results_may_arrive_out_of_order() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let stub = ns.get_by_name("a").unwrap();

    let slow = stub.call("sleep", vec![json!(200).into()]);
    let fast = stub.call("sleep", vec![json!(10).into()]);
    let (slow, fast) = tokio::join!(
        async {
            let value = slow.await.unwrap();
            (value, tokio::time::Instant::now())
        },
        async {
            let value = fast.await.unwrap();
            (value, tokio::time::Instant::now())
        }
    );
    assert_eq!(slow.0.as_value(), Some(&json!(200)));
    assert_eq!(fast.0.as_value(), Some(&json!(10)));
    assert!(fast.1 < slow.1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_errors_keep_name_and_message() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let stub = ns.get_by_name("a").unwrap();

    let err = stub.call("fail", vec![]).await.unwrap_err();
    assert_eq!(err.code(), "TypeError");
    assert!(err.to_string().contains("bad input"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_only_plain_data_crosses() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let stub = ns.get_by_name("a").unwrap();

    let err = stub
        .call("append", vec![RpcValue::Object(LocalObject::new(7u8))])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRpcArgument(_)));

    let err = stub.call("me", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRpcReturnValue(_)));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_fetch_through_executor() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let id = ns.id_from_name("web");

    let response = ns.fetch(&id, FetchRequest::post("http://journal/", "x")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), Some("POST"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_disposed_executor_fails_fast() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let id = ns.id_from_name("gone");
    let stub = ns.get(&id).unwrap();
    stub.call("increment", vec![]).await.unwrap();

    let pending = stub.call("sleep", vec![json!(5_000).into()]);
    let instance = ns.instance(&id).unwrap();
    let waiter = tokio::spawn(pending.into_future());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let Instance::Isolated(executor) = instance else {
        panic!("expected an isolated instance");
    };
    executor.dispose();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ExecutorTerminated(_)));
    let err = stub.call("increment", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ExecutorTerminated(_)));

    // The namespace replaces a disposed executor; state is intact.
    let count = ns.get(&id).unwrap().call("increment", vec![]).await.unwrap();
    assert_eq!(count.as_value(), Some(&json!(2)));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failed_construction_rejects_queued_commands() {
    let runtime = runtime();
    let ns = runtime.namespace("Fragile", NamespaceOptions::isolated());
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    ns.bind(factory(move |state: ActorState, _env: Env| {
        if !flag.swap(true, Ordering::SeqCst) {
            return Err(Error::actor("Error", "constructor failed"));
        }
        Ok(Journal { state })
    }))
    .unwrap();

    let stub = ns.get_by_name("f").unwrap();
    let (first, second) = tokio::join!(
        stub.call("increment", vec![]).into_future(),
        stub.call("increment", vec![]).into_future()
    );
    for result in [first, second] {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::ExecutorTerminated(ref msg) if msg.contains("constructor failed")));
    }

    let err = stub.call("increment", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ExecutorTerminated(_)));

    let replacement = ns.get_by_name("f").unwrap();
    assert!(!replacement.ptr_eq(&stub));
    let count = replacement.call("increment", vec![]).await.unwrap();
    assert_eq!(count.as_value(), Some(&json!(1)));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_state_persists_across_runtimes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        path: Some(dir.path().join("durable.db")),
        ..StorageConfig::default()
    };

    let first = runtime_with(storage.clone());
    journal(&first)
        .get_by_name("p")
        .unwrap()
        .call("append", vec![json!("data").into()])
        .await
        .unwrap();
    first.shutdown().await;

    let second = runtime_with(storage);
    assert_eq!(read_log(&journal(&second), "p").await, vec!["data"]);
    second.shutdown().await;
}

// =============================================================================
// Alarms and sockets
// =============================================================================

#[tokio::test]
async fn test_alarm_set_inside_executor_fires_and_retries() {
    let runtime = runtime();
    let ns = journal(&runtime);
    ns.get_by_name("alarm")
        .unwrap()
        .call("scheduleIn", vec![json!(50).into()])
        .await
        .unwrap();

    let expected = vec!["alarm:0:false".to_string(), "alarm:1:true".to_string()];
    let (ns_ref, expected_ref) = (&ns, &expected);
    assert!(eventually(move || async move { read_log(ns_ref, "alarm").await == *expected_ref }).await);

    let partition = Partition::new("Journal", ns.id_from_name("alarm"));
    let (engine, partition_ref) = (runtime.engine(), &partition);
    assert!(eventually(move || async move { engine.get_alarm(partition_ref).unwrap().is_none() }).await);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_socket_bridge_round_trip() {
    let runtime = runtime();
    let ns = journal(&runtime);
    let id = ns.id_from_name("chat");
    ns.get(&id).unwrap().call("autoReply", vec![]).await.unwrap();

    let (socket, mut peer) = HibernatableSocket::pair();
    let response = ns
        .fetch(&id, FetchRequest::get("http://journal/ws").with_socket(socket.clone()))
        .await
        .unwrap();
    assert_eq!(response.status, 101);
    assert_eq!(peer.recv().await, Some(OutboundFrame::Message("welcome".into())));

    let instance = ns.instance(&id).unwrap();
    let Instance::Isolated(executor) = instance.clone() else {
        panic!("expected an isolated instance");
    };
    assert_eq!(executor.socket_count(), 1);

    instance.socket_message(socket.id(), "ping".into()).await.unwrap();
    assert_eq!(peer.recv().await, Some(OutboundFrame::Message("pong".into())));

    instance.socket_message(socket.id(), "hello".into()).await.unwrap();
    assert_eq!(peer.recv().await, Some(OutboundFrame::Message("echo:hello".into())));

    instance.socket_error(socket.id(), "reset").await.unwrap();
    instance
        .socket_close(socket.id(), 1001, "away".to_string(), true)
        .await
        .unwrap();
    assert_eq!(executor.socket_count(), 0);

    let expected = vec![
        "message:hello".to_string(),
        "error:reset".to_string(),
        "close:1001".to_string(),
    ];
    let (ns_ref, expected_ref) = (&ns, &expected);
    assert!(eventually(move || async move { read_log(ns_ref, "chat").await == *expected_ref }).await);
    runtime.shutdown().await;
}
