//! Correlations: matching externally arriving events to waiting tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::EventConsumptionStrategy;
use crate::event::CloudEvent;
use crate::resource::{Resource, ResourceMetadata, ResourceReference};

/// Events matched for one correlation subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub id: String,
    /// Correlation keys resolved from the matched events.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, String>,
    /// Matched events, in arrival order.
    #[serde(default)]
    pub events: Vec<CloudEvent>,
    /// Number of events acknowledged by the consumer.
    #[serde(default)]
    pub offset: u64,
}

impl CorrelationContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationLifetime {
    /// Deleted together with the workflow instance that created it.
    #[default]
    Ephemeral,
    Durable,
}

/// Correlation resource, created on demand by `listen` tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub metadata: ResourceMetadata,
    pub spec: CorrelationSpec,
    #[serde(default)]
    pub status: CorrelationStatus,
}

impl Correlation {
    /// Deterministic name for the correlation owned by a task instance.
    pub fn name_for(instance_name: &str, task_id: &str) -> String {
        format!("{instance_name}-{task_id}")
    }
}

impl Resource for Correlation {
    type Status = CorrelationStatus;

    const KIND: &'static str = "correlation";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        &mut self.status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSpec {
    /// Workflow instance that owns the correlation.
    pub source: ResourceReference,
    #[serde(default)]
    pub lifetime: CorrelationLifetime,
    pub events: EventConsumptionStrategy,
    /// Whether matched events are delivered one by one.
    #[serde(default)]
    pub stream: bool,
    pub outcome: CorrelationOutcome,
}

/// Where a resolved correlation context is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationOutcome {
    pub instance: ResourceReference,
    /// Reference of the task awaiting the context.
    pub task: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatusPhase {
    #[default]
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationStatus {
    #[serde(default)]
    pub phase: CorrelationStatusPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<CorrelationContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_deterministic() {
        assert_eq!(Correlation::name_for("order-42", "abc"), "order-42-abc");
        assert_eq!(
            Correlation::name_for("order-42", "abc"),
            Correlation::name_for("order-42", "abc")
        );
    }

    #[test]
    fn test_context_defaults() {
        let ctx: CorrelationContext = serde_json::from_str(r#"{"id":"c1"}"#).unwrap();
        assert_eq!(ctx, CorrelationContext::new("c1"));
        assert_eq!(ctx.offset, 0);
    }
}
