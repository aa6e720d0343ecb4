//! Resource envelope shared by every stored record with a status.
//!
//! Resources are addressed by `(namespace, name)` and carry a monotonically
//! increasing `resource_version` used for optimistic concurrency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    pub namespace: String,
    /// Incremented by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ResourceMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            resource_version: 0,
            created_at: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    /// `name.namespace`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

/// A stored record with metadata, an immutable spec, and a mutable status.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Status: Clone + Default + PartialEq + Send + Sync + Serialize + DeserializeOwned;

    /// Kind name, used for storage keys and diagnostics.
    const KIND: &'static str;

    fn metadata(&self) -> &ResourceMetadata;

    fn metadata_mut(&mut self) -> &mut ResourceMetadata;

    fn status(&self) -> &Self::Status;

    fn status_mut(&mut self) -> &mut Self::Status;
}

/// Pointer to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceReference {
    pub namespace: String,
    pub name: String,
}

impl ResourceReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Kind of change observed on a watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceWatchEventType {
    Created,
    Updated,
    Deleted,
}

/// A change notification for a watched resource.
#[derive(Debug, Clone)]
pub struct ResourceWatchEvent<R> {
    pub event_type: ResourceWatchEventType,
    pub resource: R,
}
