//! Alarm scheduling: one persisted wake-up per instance, retried on failure.

mod policy;
mod scheduler;

pub use policy::RetryPolicy;
pub use scheduler::AlarmScheduler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{InstanceId, Result};

/// Argument passed to an instance's alarm handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlarmInfo {
    /// Zero on the first invocation, then one more per retry.
    pub retry_count: u32,
    pub is_retry: bool,
}

/// Receives firings for every instance of one namespace.
#[async_trait]
pub trait AlarmTarget: Send + Sync {
    /// Run the alarm handler of `instance`. An error schedules a retry.
    async fn fire(&self, instance: InstanceId, info: AlarmInfo) -> Result<()>;
}
