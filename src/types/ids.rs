//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `new()` (UUID v4), `from_string()`, `as_str()`,
/// `Default`, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(SocketId);

/// Identifier of one durable instance within a namespace.
///
/// Equality, ordering and hashing only look at the identifier string; the
/// optional name is informational (it is what `id_from_name` derived from).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceId {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl InstanceId {
    /// Deterministic id: `hex(sha256(class_name ":" name))`.
    pub fn from_name(class_name: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(class_name.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        Self {
            id: hex::encode(hasher.finalize()),
            name: Some(name.to_string()),
        }
    }

    /// Wrap a caller-supplied identifier verbatim.
    pub fn from_string(raw: impl Into<String>) -> Result<Self, &'static str> {
        let id = raw.into();
        if id.is_empty() {
            return Err("InstanceId cannot be empty");
        }
        Ok(Self { id, name: None })
    }

    /// Random id.
    pub fn unique() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PartialEq for InstanceId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InstanceId {}

impl Hash for InstanceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for InstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
