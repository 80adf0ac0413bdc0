//! Core types for the durable actor runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: `InstanceId` (derived, raw or random) and `SocketId`
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for storage, alarms, eviction and executors

mod config;
mod errors;
mod ids;

pub use config::{
    AlarmConfig, Config, EvictionConfig, ExecutorConfig, ObservabilityConfig, StorageConfig,
};
pub use errors::{Error, ErrorInfo, Result};
pub use ids::{InstanceId, SocketId};
