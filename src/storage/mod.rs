//! Persistent per-instance storage.
//!
//! One physical store holds every `(namespace, instance_id)` partition:
//! - `instance_storage(namespace, instance_id, key, value)` for key/value rows
//! - `instance_alarms(namespace, instance_id, fire_time)` for the single pending alarm
//!
//! Values are opaque JSON documents; the engine never looks inside them.

mod actor;
mod engine;
mod sql;

pub use actor::{ActorStorage, StorageTransaction};
pub use engine::{AlarmRow, InstanceSummary, StorageEngine};
pub(crate) use actor::AlarmControl;

use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Storage partition owned by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub namespace: String,
    pub instance: InstanceId,
}

impl Partition {
    pub fn new(namespace: impl Into<String>, instance: InstanceId) -> Self {
        Self {
            namespace: namespace.into(),
            instance,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.instance)
    }
}

/// Options for [`ActorStorage::list`].
///
/// `start` is inclusive and `end` exclusive; `prefix` is applied on top of
/// the range. Results come back in ascending key order unless `reverse`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn range(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}
