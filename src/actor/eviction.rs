//! Background eviction of idle instances.
//!
//! EvictionService periodically sweeps every registered namespace and drops
//! instances that have been idle past the configured timeout and hold
//! nothing that must stay live (stubs, in-flight calls, sockets, a pending
//! start-up or an armed alarm). Their state stays in storage; the next
//! access constructs a fresh instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::interval;

use super::Namespace;
use crate::types::EvictionConfig;

/// Namespaces swept by the eviction service, keyed by class name.
pub type NamespaceRegistry = Arc<RwLock<HashMap<String, Namespace>>>;

/// Statistics from one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionStats {
    /// Namespaces visited
    pub namespaces: usize,
    /// Instances dropped
    pub evicted: usize,
    /// When the sweep completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// Runs [`Namespace::evict_idle`] over every namespace on an interval.
#[derive(Debug)]
pub struct EvictionService {
    registry: NamespaceRegistry,
    config: EvictionConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl EvictionService {
    pub fn new(registry: NamespaceRegistry, config: EvictionConfig) -> Self {
        Self {
            registry,
            config,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns `None` when no idle timeout is configured.
    pub fn start(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        let idle_timeout = self.config.idle_timeout?;
        let sweep_interval = self.config.sweep_interval;
        let registry = self.registry.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tracing::info!(
            "eviction_service_started: idle_timeout={:?} sweep_interval={:?}",
            idle_timeout,
            sweep_interval
        );
        Some(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = Self::run_cycle(&registry, idle_timeout);
                        if stats.evicted > 0 {
                            tracing::debug!(
                                "eviction_cycle_completed: namespaces={}, evicted={}",
                                stats.namespaces,
                                stats.evicted,
                            );
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("eviction_service_stopped");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run one sweep.
    pub fn run_cycle(registry: &NamespaceRegistry, idle_timeout: Duration) -> EvictionStats {
        // Snapshot so the registry lock is not held while sweeping.
        let namespaces: Vec<Namespace> = registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        let mut stats = EvictionStats {
            namespaces: namespaces.len(),
            ..EvictionStats::default()
        };
        for namespace in &namespaces {
            stats.evicted += namespace.evict_idle(idle_timeout);
        }
        stats.completed_at = Some(Utc::now());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{factory, ActorState, DurableObject, NamespaceOptions};
    use crate::alarms::AlarmScheduler;
    use crate::rpc::{Capability, RpcValue};
    use crate::storage::StorageEngine;
    use crate::types::{AlarmConfig, Result};
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Capability for Idle {
        async fn call(self: Arc<Self>, _method: &str, _args: Vec<RpcValue>) -> Result<RpcValue> {
            Ok(RpcValue::null())
        }
    }

    impl DurableObject for Idle {}

    fn registry_with(names: &[&str]) -> (NamespaceRegistry, Vec<Namespace>) {
        let engine = StorageEngine::in_memory().unwrap();
        let scheduler = AlarmScheduler::start(engine.clone(), AlarmConfig::default());
        let registry: NamespaceRegistry = Arc::default();
        let mut namespaces = Vec::new();
        for name in names {
            let ns = Namespace::new(*name, engine.clone(), scheduler.clone(), NamespaceOptions::default());
            ns.bind(factory(|_state: ActorState, _env| Ok(Idle))).unwrap();
            registry.write().unwrap().insert(name.to_string(), ns.clone());
            namespaces.push(ns);
        }
        (registry, namespaces)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_sweeps_every_namespace() {
        let (registry, namespaces) = registry_with(&["A", "B"]);
        for ns in &namespaces {
            ns.instance(&ns.id_from_name("x")).unwrap();
        }

        let stats = EvictionService::run_cycle(&registry, Duration::from_secs(30));
        assert_eq!(stats.namespaces, 2);
        assert_eq!(stats.evicted, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let stats = EvictionService::run_cycle(&registry, Duration::from_secs(30));
        assert_eq!(stats.evicted, 2);
        assert!(stats.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_disabled_without_timeout() {
        let (registry, _) = registry_with(&["A"]);
        let mut service = EvictionService::new(registry, EvictionConfig::default());
        assert!(service.start().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_evicts_in_background() {
        let (registry, namespaces) = registry_with(&["A"]);
        let ns = &namespaces[0];
        ns.instance(&ns.id_from_name("x")).unwrap();

        let mut service = EvictionService::new(
            registry,
            EvictionConfig {
                idle_timeout: Some(Duration::from_secs(10)),
                sweep_interval: Duration::from_secs(5),
            },
        );
        let task = service.start().unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ns.live_instances(), 0);

        service.stop();
        task.await.unwrap();
    }
}
