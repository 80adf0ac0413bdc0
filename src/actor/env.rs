//! Environment handed to every instance constructor.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::Namespace;
use crate::types::{Error, Result};

/// Immutable variables plus named bindings to other namespaces.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: Arc<Map<String, Value>>,
    namespaces: Arc<HashMap<String, Namespace>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.vars).insert(name.into(), value.into());
        self
    }

    pub fn with_namespace(mut self, binding: impl Into<String>, namespace: Namespace) -> Self {
        Arc::make_mut(&mut self.namespaces).insert(binding.into(), namespace);
        self
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn var_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.vars
            .get(name)
            .map(|value| serde_json::from_value(value.clone()).map_err(Error::from))
            .transpose()
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// The namespace bound as `binding`.
    pub fn namespace(&self, binding: &str) -> Result<&Namespace> {
        self.namespaces
            .get(binding)
            .ok_or_else(|| Error::BindingNotWired(format!("no namespace bound as {}", binding)))
    }
}
