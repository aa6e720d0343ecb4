//! Workflow and task instances: the persisted runtime state of one execution.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::definition::FlowDirective;
use crate::error::ErrorDetails;
use crate::resource::{Resource, ResourceMetadata};

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub metadata: ResourceMetadata,
    pub spec: WorkflowInstanceSpec,
    #[serde(default)]
    pub status: WorkflowInstanceStatus,
}

impl WorkflowInstance {
    pub fn new(metadata: ResourceMetadata, spec: WorkflowInstanceSpec) -> Self {
        Self {
            metadata,
            spec,
            status: WorkflowInstanceStatus::default(),
        }
    }

    pub fn qualified_name(&self) -> String {
        self.metadata.qualified_name()
    }
}

impl Resource for WorkflowInstance {
    type Status = WorkflowInstanceStatus;

    const KIND: &'static str = "workflow-instance";

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
pub struct WorkflowInstanceSpec {
    pub definition: WorkflowDefinitionReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Identifies one version of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowDefinitionReference {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for WorkflowDefinitionReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.name, self.namespace, self.version)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatusPhase {
    #[default]
    Pending,
    Running,
    Waiting,
    Suspended,
    Faulted,
    Cancelled,
    Completed,
}

impl WorkflowInstanceStatusPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowInstanceStatusPhase::Faulted
                | WorkflowInstanceStatusPhase::Cancelled
                | WorkflowInstanceStatusPhase::Completed
        )
    }
}

impl std::fmt::Display for WorkflowInstanceStatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowInstanceStatusPhase::Pending => "pending",
            WorkflowInstanceStatusPhase::Running => "running",
            WorkflowInstanceStatusPhase::Waiting => "waiting",
            WorkflowInstanceStatusPhase::Suspended => "suspended",
            WorkflowInstanceStatusPhase::Faulted => "faulted",
            WorkflowInstanceStatusPhase::Cancelled => "cancelled",
            WorkflowInstanceStatusPhase::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceStatus {
    #[serde(default)]
    pub phase: WorkflowInstanceStatusPhase,
    /// One entry per start/resume cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<RunInfo>,
    /// Document holding the workflow-scoped context data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_reference: Option<String>,
    /// Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskInstance>,
    #[serde(default)]
    pub correlation: WorkflowCorrelationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl WorkflowInstanceStatus {
    pub fn task(&self, id: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut TaskInstance> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Direct children of `parent_id`, in creation order.
    pub fn children<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a TaskInstance> {
        self.tasks
            .iter()
            .filter(move |task| task.parent_id.as_deref() == Some(parent_id))
    }

    /// Total running time across all runs, counting an open run up to now.
    pub fn execution_time(&self) -> Duration {
        total_run_time(self.runs.iter().map(|run| (run.started_at, run.ended_at)))
    }

    /// Close the currently open run, if any.
    pub fn close_run(&mut self, at: DateTime<Utc>) {
        if let Some(run) = self.runs.last_mut() {
            if run.ended_at.is_none() {
                run.ended_at = Some(at);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Correlation contexts resolved for `listen` tasks, keyed by task reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCorrelationStatus {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, CorrelationContext>,
}

// ---------------------------------------------------------------------------
// TaskInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInstanceStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Faulted,
    Cancelled,
    Suspended,
    Skipped,
}

impl TaskInstanceStatus {
    /// Terminal statuses are never left. `Suspended` is resumable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::Completed
                | TaskInstanceStatus::Faulted
                | TaskInstanceStatus::Cancelled
                | TaskInstanceStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskInstanceStatus::Pending => "pending",
            TaskInstanceStatus::Running => "running",
            TaskInstanceStatus::Completed => "completed",
            TaskInstanceStatus::Faulted => "faulted",
            TaskInstanceStatus::Cancelled => "cancelled",
            TaskInstanceStatus::Suspended => "suspended",
            TaskInstanceStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One instantiation of a task definition within a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: String,
    pub name: String,
    /// Structural path into the definition graph, e.g. `/do/0/greet`.
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_extension: bool,
    #[serde(default)]
    pub status: TaskInstanceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<TaskRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<FlowDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl TaskInstance {
    pub fn new(
        name: impl Into<String>,
        reference: impl Into<String>,
        parent_id: Option<String>,
        is_extension: bool,
    ) -> Self {
        Self {
            id: Uuid::now_v7().simple().to_string(),
            name: name.into(),
            reference: reference.into(),
            parent_id,
            is_extension,
            status: TaskInstanceStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            input_reference: None,
            context_reference: None,
            output_reference: None,
            runs: Vec::new(),
            retries: Vec::new(),
            next: None,
            error: None,
        }
    }

    pub fn is_operative(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Open a new run entry.
    pub fn begin_run(&mut self, at: DateTime<Utc>) {
        self.runs.push(TaskRun {
            started_at: at,
            ended_at: None,
            outcome: None,
        });
    }

    /// Close the currently open run with the given outcome.
    pub fn close_run(&mut self, at: DateTime<Utc>, outcome: TaskInstanceStatus) {
        if let Some(run) = self.runs.last_mut() {
            if run.ended_at.is_none() {
                run.ended_at = Some(at);
                run.outcome = Some(outcome);
            }
        }
    }

    /// Timestamp of the most recent retry, if any.
    pub fn last_retried_at(&self) -> Option<DateTime<Utc>> {
        self.retries.last().map(|retry| retry.at)
    }

    pub fn execution_time(&self) -> Duration {
        total_run_time(self.runs.iter().map(|run| (run.started_at, run.ended_at)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskInstanceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based, strictly increasing.
    pub number: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorDetails>,
}

fn total_run_time(runs: impl Iterator<Item = (DateTime<Utc>, Option<DateTime<Utc>>)>) -> Duration {
    let now = Utc::now();
    runs.map(|(started, ended)| {
        (ended.unwrap_or(now) - started)
            .to_std()
            .unwrap_or_default()
    })
    .sum()
}
