//! Runtime root.
//!
//! Owns the storage engine, the alarm scheduler and every namespace created
//! through it, and runs the eviction sweep when an idle timeout is set.

use std::sync::Mutex;
use tokio::task::JoinHandle;

use crate::actor::{EvictionService, Namespace, NamespaceOptions, NamespaceRegistry};
use crate::alarms::AlarmScheduler;
use crate::storage::StorageEngine;
use crate::types::{Config, Error, Result};

#[derive(Debug)]
struct Eviction {
    service: EvictionService,
    task: JoinHandle<()>,
}

/// Entry point: one store, one scheduler, many namespaces.
#[derive(Debug)]
pub struct Runtime {
    config: Config,
    engine: StorageEngine,
    scheduler: AlarmScheduler,
    registry: NamespaceRegistry,
    eviction: Mutex<Option<Eviction>>,
}

impl Runtime {
    /// Open storage and start the background tasks. Must be called from
    /// inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::internal("the durable runtime needs a tokio runtime"));
        }
        let engine = StorageEngine::from_config(&config.storage)?;
        let scheduler = AlarmScheduler::start(engine.clone(), config.alarms.clone());
        let registry = NamespaceRegistry::default();

        let mut service = EvictionService::new(registry.clone(), config.eviction.clone());
        let eviction = service.start().map(|task| Eviction { service, task });

        tracing::info!(
            "runtime_started: storage={} eviction={}",
            engine
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory".to_string()),
            eviction.is_some()
        );
        Ok(Self {
            config,
            engine,
            scheduler,
            registry,
            eviction: Mutex::new(eviction),
        })
    }

    /// In-memory runtime with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &AlarmScheduler {
        &self.scheduler
    }

    /// The namespace registered as `class_name`, created with `options` on
    /// first use. Later calls return the same namespace and ignore `options`.
    pub fn namespace(&self, class_name: &str, options: NamespaceOptions) -> Namespace {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .entry(class_name.to_string())
            .or_insert_with(|| {
                let options = NamespaceOptions {
                    executor: options.executor.or_else(|| Some(self.config.executor.clone())),
                    ..options
                };
                tracing::debug!(
                    "namespace_created: class={} isolated={}",
                    class_name,
                    options.isolated
                );
                Namespace::new(class_name, self.engine.clone(), self.scheduler.clone(), options)
            })
            .clone()
    }

    pub fn get_namespace(&self, class_name: &str) -> Option<Namespace> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(class_name)
            .cloned()
    }

    /// Names of every registered namespace, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stop eviction and the scheduler and dispose every live instance.
    /// Persisted state, alarms included, is kept.
    pub async fn shutdown(&self) {
        let eviction = self
            .eviction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut eviction) = eviction {
            eviction.service.stop();
            if let Err(e) = eviction.task.await {
                tracing::warn!("eviction_task_join_failed: error={}", e);
            }
        }

        let namespaces: Vec<Namespace> = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for namespace in &namespaces {
            namespace.shutdown();
        }
        self.scheduler.shutdown();
        tracing::info!("runtime_stopped: namespaces={}", namespaces.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{factory, ActorState, DurableObject};
    use crate::rpc::{Capability, RpcValue};
    use crate::types::EvictionConfig;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        async fn call(self: Arc<Self>, _method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
            Ok(args.into_iter().next().unwrap_or_else(RpcValue::null))
        }
    }

    impl DurableObject for Echo {}

    #[tokio::test]
    async fn test_namespace_is_registered_once() {
        let runtime = Runtime::in_memory().unwrap();
        let first = runtime.namespace("Echo", NamespaceOptions::default());
        first.bind(factory(|_state: ActorState, _env| Ok(Echo))).unwrap();

        let second = runtime.namespace("Echo", NamespaceOptions::isolated());
        assert!(second.is_bound());
        assert_eq!(runtime.namespaces(), vec!["Echo".to_string()]);
        assert!(runtime.get_namespace("Other").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_runs_when_configured() {
        let config = Config {
            eviction: EvictionConfig {
                idle_timeout: Some(Duration::from_secs(5)),
                sweep_interval: Duration::from_secs(1),
            },
            ..Config::default()
        };
        let runtime = Runtime::new(config).unwrap();
        let ns = runtime.namespace("Echo", NamespaceOptions::default());
        ns.bind(factory(|_state: ActorState, _env| Ok(Echo))).unwrap();

        let value = ns
            .get_by_name("a")
            .unwrap()
            .call("echo", vec![RpcValue::from_json(&1).unwrap()])
            .await
            .unwrap();
        assert_eq!(value.as_value(), Some(&serde_json::json!(1)));
        assert_eq!(ns.live_instances(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ns.live_instances(), 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_live_instances() {
        let runtime = Runtime::in_memory().unwrap();
        let ns = runtime.namespace("Echo", NamespaceOptions::default());
        ns.bind(factory(|_state: ActorState, _env| Ok(Echo))).unwrap();
        ns.instance(&ns.id_from_name("a")).unwrap();

        runtime.shutdown().await;
        assert_eq!(ns.live_instances(), 0);
    }
}
