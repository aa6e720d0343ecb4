//! Workflow definition model.
//!
//! A workflow is a `document` header plus an ordered `do` list of named task
//! definitions. Task definitions share a set of common fields (`if`, `input`,
//! `output`, `export`, `timeout`, `then`) and carry exactly one kind-specific
//! body (`call`, `do`, `fork`, `for`, `listen`, `raise`, `set`, `switch`,
//! `try`, `wait`, `emit`). Named lists are encoded as sequences of
//! single-entry maps:
//!
//! ```yaml
//! do:
//!   - greet:
//!       set:
//!         message: hello
//!   - pause:
//!       wait:
//!         seconds: 1
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::CloudEvent;

// ---------------------------------------------------------------------------
// Named lists
// ---------------------------------------------------------------------------

/// Ordered list of named entries, serialized as `[{name: value}, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedList<T>(pub Vec<(String, T)>);

/// Ordered list of named task definitions.
pub type TaskList = NamedList<TaskDefinition>;

impl<T> NamedList<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an entry, builder style.
    pub fn with(mut self, name: impl Into<String>, value: T) -> Self {
        self.0.push((name.into(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Entry at `index`, with its name.
    pub fn get(&self, index: usize) -> Option<(&str, &T)> {
        self.0.get(index).map(|(name, value)| (name.as_str(), value))
    }

    /// Index of the first entry named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n == name)
    }

    pub fn find(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl<T> Default for NamedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct SingleEntry<'a, T>(&'a str, &'a T);

impl<T: Serialize> Serialize for SingleEntry<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

impl<T: Serialize> Serialize for NamedList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            seq.serialize_element(&SingleEntry(name, value))?;
        }
        seq.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<BTreeMap<String, T>>::deserialize(deserializer)?;
        Ok(Self(entries.into_iter().flat_map(|entry| entry.into_iter()).collect()))
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Top-level workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub document: DocumentDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<ComponentCollection>,
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
}

impl WorkflowDefinition {
    /// Minimal definition with the given identity and task list.
    pub fn new(namespace: &str, name: &str, version: &str, do_: TaskList) -> Self {
        Self {
            document: DocumentDefinition {
                dsl: default_dsl(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                version: version.to_string(),
                title: None,
                summary: None,
            },
            input: None,
            use_: None,
            do_,
            timeout: None,
            output: None,
        }
    }

    /// `name.namespace:version`
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}:{}",
            self.document.name, self.document.namespace, self.document.version
        )
    }

    /// Declared extensions, in declaration order.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &ExtensionDefinition)> {
        self.use_
            .iter()
            .flat_map(|components| components.extensions.iter())
            .flat_map(|list| list.iter())
    }
}

/// Identity of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDefinition {
    #[serde(default = "default_dsl")]
    pub dsl: String,
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn default_dsl() -> String {
    "1.0.0".to_string()
}

/// Reusable components declared under `use`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentCollection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<NamedList<ExtensionDefinition>>,
}

/// Before/after hooks wrapping tasks of a given kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDefinition {
    /// Task kind the extension applies to (`call`, `set`, ...) or `all`.
    pub extend: String,
    /// Runtime expression gating the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<TaskList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<TaskList>,
}

impl ExtensionDefinition {
    /// Whether this extension targets tasks of kind `task_type`.
    pub fn applies_to(&self, task_type: &str) -> bool {
        self.extend == "all" || self.extend == task_type
    }
}

// ---------------------------------------------------------------------------
// Common task fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    /// Filter applied to the raw input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    /// Filter applied to the raw output.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportDefinition {
    /// Expression producing the new workflow context.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutDefinition {
    pub after: DurationDefinition,
}

/// A duration expressed as the sum of its components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milliseconds: Option<u64>,
}

impl DurationDefinition {
    pub fn from_millis(milliseconds: u64) -> Self {
        Self {
            milliseconds: Some(milliseconds),
            ..Self::default()
        }
    }

    pub fn from_secs(seconds: u64) -> Self {
        Self {
            seconds: Some(seconds),
            ..Self::default()
        }
    }

    pub fn to_duration(&self) -> Duration {
        let secs = self.days.unwrap_or(0) * 86_400
            + self.hours.unwrap_or(0) * 3_600
            + self.minutes.unwrap_or(0) * 60
            + self.seconds.unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_millis(self.milliseconds.unwrap_or(0))
    }
}

/// Post-completion routing decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowDirective {
    /// Proceed to the next task in declaration order.
    #[default]
    Continue,
    /// End the workflow.
    End,
    /// Exit the enclosing composite task.
    Exit,
    /// Jump to the named task within the same list.
    Goto(String),
}

impl From<String> for FlowDirective {
    fn from(value: String) -> Self {
        match value.as_str() {
            "continue" => FlowDirective::Continue,
            "end" => FlowDirective::End,
            "exit" => FlowDirective::Exit,
            _ => FlowDirective::Goto(value),
        }
    }
}

impl From<&str> for FlowDirective {
    fn from(value: &str) -> Self {
        FlowDirective::from(value.to_string())
    }
}

impl From<FlowDirective> for String {
    fn from(value: FlowDirective) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for FlowDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowDirective::Continue => write!(f, "continue"),
            FlowDirective::End => write!(f, "end"),
            FlowDirective::Exit => write!(f, "exit"),
            FlowDirective::Goto(task) => write!(f, "{task}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task definition
// ---------------------------------------------------------------------------

/// One node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Runtime expression; the task is skipped when it evaluates falsy.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskDefinition {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            if_: None,
            input: None,
            output: None,
            export: None,
            timeout: None,
            then: None,
            metadata: BTreeMap::new(),
            kind,
        }
    }

    pub fn set(value: Value) -> Self {
        Self::new(TaskKind::Set(SetTaskDefinition { set: value }))
    }

    pub fn wait(duration: DurationDefinition) -> Self {
        Self::new(TaskKind::Wait(WaitTaskDefinition { wait: duration }))
    }

    pub fn do_(tasks: TaskList) -> Self {
        Self::new(TaskKind::Do(DoTaskDefinition { do_: tasks }))
    }

    pub fn call(function: &str, with: Option<Value>) -> Self {
        Self::new(TaskKind::Call(CallTaskDefinition {
            call: function.to_string(),
            with,
        }))
    }

    pub fn fork(branches: TaskList, compete: bool) -> Self {
        Self::new(TaskKind::Fork(ForkTaskDefinition {
            fork: BranchingDefinition { branches, compete },
        }))
    }

    pub fn raise(error: ErrorDefinition) -> Self {
        Self::new(TaskKind::Raise(RaiseTaskDefinition {
            raise: RaiseErrorDefinition { error },
        }))
    }

    pub fn with_then(mut self, then: impl Into<FlowDirective>) -> Self {
        self.then = Some(then.into());
        self
    }

    pub fn with_if(mut self, condition: &str) -> Self {
        self.if_ = Some(condition.to_string());
        self
    }

    pub fn with_timeout(mut self, after: DurationDefinition) -> Self {
        self.timeout = Some(TimeoutDefinition { after });
        self
    }

    pub fn with_input_from(mut self, from: Value) -> Self {
        self.input = Some(InputDefinition { from: Some(from) });
        self
    }

    pub fn with_output_as(mut self, as_: Value) -> Self {
        self.output = Some(OutputDefinition { as_: Some(as_) });
        self
    }

    pub fn with_export_as(mut self, as_: Value) -> Self {
        self.export = Some(ExportDefinition { as_: Some(as_) });
        self
    }

    /// Kind name used for extension matching and diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Kind-specific body of a task. Exactly one is present per task.
///
/// Variant order matters for deserialization: kinds that also carry a `do`
/// list (`for`) must be tried before plain `do`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskKind {
    For(ForTaskDefinition),
    Try(TryTaskDefinition),
    Listen(ListenTaskDefinition),
    Call(CallTaskDefinition),
    Fork(ForkTaskDefinition),
    Switch(SwitchTaskDefinition),
    Raise(RaiseTaskDefinition),
    Emit(EmitTaskDefinition),
    Wait(WaitTaskDefinition),
    Set(SetTaskDefinition),
    Do(DoTaskDefinition),
}

impl TaskKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::For(_) => "for",
            TaskKind::Try(_) => "try",
            TaskKind::Listen(_) => "listen",
            TaskKind::Call(_) => "call",
            TaskKind::Fork(_) => "fork",
            TaskKind::Switch(_) => "switch",
            TaskKind::Raise(_) => "raise",
            TaskKind::Emit(_) => "emit",
            TaskKind::Wait(_) => "wait",
            TaskKind::Set(_) => "set",
            TaskKind::Do(_) => "do",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTaskDefinition {
    /// Name of the function to invoke.
    pub call: String,
    /// Arguments, evaluated against the task input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTaskDefinition {
    #[serde(rename = "do")]
    pub do_: TaskList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTaskDefinition {
    pub fork: BranchingDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchingDefinition {
    pub branches: TaskList,
    /// First branch to complete wins; the others are cancelled.
    #[serde(default)]
    pub compete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTaskDefinition {
    #[serde(rename = "for")]
    pub for_: ForLoopDefinition,
    /// Evaluated before each iteration; the loop stops when falsy.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    #[serde(rename = "do")]
    pub do_: TaskList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoopDefinition {
    #[serde(default = "default_item_variable")]
    pub each: String,
    /// Expression producing the collection to iterate.
    #[serde(rename = "in")]
    pub in_: String,
    #[serde(default = "default_index_variable")]
    pub at: String,
    /// Maximum number of items processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTaskDefinition {
    pub switch: NamedList<SwitchCaseDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCaseDefinition {
    /// Case condition; a case without one is the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub then: FlowDirective,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTaskDefinition {
    pub raise: RaiseErrorDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseErrorDefinition {
    pub error: ErrorDefinition,
}

/// Error raised by a `raise` task. `title` and `detail` may be runtime expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDefinition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTaskDefinition {
    pub set: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTaskDefinition {
    pub wait: DurationDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTaskDefinition {
    pub emit: EventEmissionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEmissionDefinition {
    pub event: EventDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    /// CloudEvent attributes; values may be runtime expressions.
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Listen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTaskDefinition {
    pub listen: ListenerDefinition,
    /// When present, events are consumed one by one as a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<SubscriptionIterator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerDefinition {
    pub to: EventConsumptionStrategy,
}

/// Which events satisfy a listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventConsumptionStrategy {
    /// Every filter must be matched once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<EventFilter>>,
    /// Any single filter match suffices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<EventFilter>>,
    /// Exactly one filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one: Option<EventFilter>,
    /// For streams: the condition that ends consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Box<EventConsumptionStrategy>>,
}

impl EventConsumptionStrategy {
    /// Whether `event` satisfies any of the strategy's filters.
    pub fn matches_any(&self, event: &CloudEvent) -> bool {
        self.filters().iter().any(|filter| filter.matches(event))
    }

    /// All filters declared by the strategy, excluding `until`.
    pub fn filters(&self) -> Vec<&EventFilter> {
        let mut filters: Vec<&EventFilter> = Vec::new();
        if let Some(all) = &self.all {
            filters.extend(all.iter());
        }
        if let Some(any) = &self.any {
            filters.extend(any.iter());
        }
        if let Some(one) = &self.one {
            filters.push(one);
        }
        filters
    }
}

/// Attribute filter for incoming events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// CloudEvent attributes that must match exactly.
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
    /// Correlation keys extracted from matching events.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlate: BTreeMap<String, CorrelationKeyDefinition>,
}

impl EventFilter {
    /// Whether every declared attribute equals the event's.
    pub fn matches(&self, event: &CloudEvent) -> bool {
        self.with
            .iter()
            .all(|(name, expected)| event.attribute(name).as_ref() == Some(expected))
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.with.insert(name.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationKeyDefinition {
    /// Expression extracting the key from an event.
    pub from: String,
    /// Expected key value, if fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionIterator {
    #[serde(default = "default_item_variable")]
    pub item: String,
    #[serde(default = "default_index_variable")]
    pub at: String,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

// ---------------------------------------------------------------------------
// Try / catch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTaskDefinition {
    #[serde(rename = "try")]
    pub try_: TaskList,
    pub catch: ErrorCatcherDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCatcherDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilterDefinition>,
    /// Context variable the caught error is bound to (default `error`).
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyDefinition>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilterDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<ErrorFilterProperties>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilterProperties {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DurationDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RetryLimitDefinition>,
}

impl RetryPolicyDefinition {
    /// Maximum number of retry attempts, if bounded.
    pub fn max_attempts(&self) -> Option<u32> {
        self.limit
            .as_ref()
            .and_then(|limit| limit.attempt.as_ref())
            .and_then(|attempt| attempt.count)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay.map(|d| d.to_duration()).unwrap_or_default();
        match self.backoff {
            None | Some(BackoffDefinition::Constant {}) => base,
            Some(BackoffDefinition::Linear {}) => base * attempt.max(1),
            Some(BackoffDefinition::Exponential {}) => {
                base * 2u32.saturating_pow(attempt.saturating_sub(1))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffDefinition {
    Constant {},
    Linear {},
    Exponential {},
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimitDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<RetryAttemptLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryAttemptLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}
