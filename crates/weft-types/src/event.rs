//! CloudEvents and the engine's lifecycle event vocabulary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A CloudEvent (v1.0 structured mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

fn default_spec_version() -> String {
    "1.0".to_string()
}

impl CloudEvent {
    pub fn new(source: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            specversion: default_spec_version(),
            id: Uuid::now_v7().to_string(),
            source: source.into(),
            type_: type_.into(),
            subject: None,
            time: Some(Utc::now()),
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    /// Looks up a context attribute (or extension) by name.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "specversion" => Some(Value::String(self.specversion.clone())),
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.type_.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            "data" => self.data.clone(),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// Builds an event from a free-form attribute map, as declared by `emit`.
    pub fn from_attributes(mut attributes: BTreeMap<String, Value>) -> Result<Self, String> {
        let mut take_string = |name: &str| match attributes.remove(name) {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(format!("attribute '{name}' must be a string, got {other}")),
            None => Ok(None),
        };
        let source = take_string("source")?.ok_or("missing required attribute 'source'")?;
        let type_ = take_string("type")?.ok_or("missing required attribute 'type'")?;
        let id = take_string("id")?;
        let subject = take_string("subject")?;
        let datacontenttype = take_string("datacontenttype")?;
        attributes.remove("specversion");
        attributes.remove("time");
        let data = attributes.remove("data");

        let mut event = CloudEvent::new(source, type_);
        if let Some(id) = id {
            event.id = id;
        }
        event.subject = subject;
        event.datacontenttype = datacontenttype.or_else(|| data.as_ref().map(|_| "application/json".to_string()));
        event.data = data;
        event.extensions = attributes;
        Ok(event)
    }
}

/// Source attribute of every lifecycle event emitted by the engine.
pub const LIFECYCLE_EVENT_SOURCE: &str = "https://weft.io/runtime";

/// Lifecycle transitions shared by workflows and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Created,
    Started,
    Retrying,
    Suspended,
    Resumed,
    Cancelled,
    Faulted,
    Completed,
    Skipped,
    Ended,
}

impl LifecycleEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEventKind::Created => "created",
            LifecycleEventKind::Started => "started",
            LifecycleEventKind::Retrying => "retrying",
            LifecycleEventKind::Suspended => "suspended",
            LifecycleEventKind::Resumed => "resumed",
            LifecycleEventKind::Cancelled => "cancelled",
            LifecycleEventKind::Faulted => "faulted",
            LifecycleEventKind::Completed => "completed",
            LifecycleEventKind::Skipped => "skipped",
            LifecycleEventKind::Ended => "ended",
        }
    }

    /// e.g. `io.weft.events.workflow.completed.v1`
    pub fn workflow_event_type(self) -> String {
        format!("io.weft.events.workflow.{}.v1", self.as_str())
    }

    /// e.g. `io.weft.events.task.faulted.v1`
    pub fn task_event_type(self) -> String {
        format!("io.weft.events.task.{}.v1", self.as_str())
    }
}

/// Payload of workflow lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLifecycleEventData {
    pub workflow: String,
    pub definition: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ErrorDetails>,
}

/// Payload of task lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLifecycleEventData {
    pub workflow: String,
    pub task: String,
    pub reference: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ErrorDetails>,
}
