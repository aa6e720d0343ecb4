//! The `Workflow` resource: a stored definition plus per-version statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::WorkflowDefinition;
use crate::resource::{Resource, ResourceMetadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ResourceMetadata,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Stored versions, oldest first.
    pub versions: Vec<WorkflowDefinition>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        let metadata = ResourceMetadata::new(
            definition.document.namespace.clone(),
            definition.document.name.clone(),
        );
        Self {
            metadata,
            spec: WorkflowSpec {
                versions: vec![definition],
            },
            status: WorkflowStatus::default(),
        }
    }

    pub fn version(&self, version: &str) -> Option<&WorkflowDefinition> {
        self.spec
            .versions
            .iter()
            .find(|def| def.document.version == version)
    }
}

impl Resource for Workflow {
    type Status = WorkflowStatus;

    const KIND: &'static str = "workflow";

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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Statistics keyed by definition version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, WorkflowVersionStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersionStatus {
    #[serde(default)]
    pub total_instances: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ended_at: Option<DateTime<Utc>>,
}
