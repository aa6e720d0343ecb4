//! The workflow execution context: the only way executors read or mutate a
//! workflow instance.
//!
//! Both backends share [`ExecutionState`] for task and workflow transitions
//! and differ in how state is persisted, how definition statistics are kept,
//! and how events are correlated.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use weft_types::config::EngineConfig;
use weft_types::correlation::CorrelationContext;
use weft_types::definition::{FlowDirective, ListenerDefinition, TaskDefinition, WorkflowDefinition};
use weft_types::error::ErrorDetails;
use weft_types::event::CloudEvent;
use weft_types::instance::{TaskInstance, WorkflowInstance};

use super::error::EngineError;
use super::expression::ExpressionEvaluator;
use super::state::ExecutionState;

/// Everything needed to materialize a new task instance.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub name: String,
    pub definition: TaskDefinition,
    /// Position of the definition relative to the parent, e.g. `do/0/greet`.
    pub path: String,
    pub input: Value,
    /// Explicit context data. Persisted as a new document when present;
    /// otherwise the task inherits its parent's (or the workflow's) context.
    pub context: Option<Value>,
    pub parent: Option<TaskInstance>,
    pub is_extension: bool,
}

/// Structural reference of a task: the parent's reference joined with `path`.
pub fn task_reference(parent: Option<&TaskInstance>, path: &str) -> String {
    let path = path.trim_matches('/');
    match parent {
        Some(parent) => format!("{}/{path}", parent.reference),
        None => format!("/{path}"),
    }
}

/// Persists a consumed offset for a streamed correlation.
pub trait OffsetAcknowledger: Send + Sync {
    fn acknowledge(&self, offset: u64) -> BoxFuture<'_, Result<(), EngineError>>;
}

/// One event delivered by [`WorkflowExecutionContext::stream`].
pub struct StreamedEvent {
    pub event: CloudEvent,
    /// 1-based position in the correlation's event sequence.
    pub offset: u64,
    acknowledger: Arc<dyn OffsetAcknowledger>,
}

impl StreamedEvent {
    pub fn new(event: CloudEvent, offset: u64, acknowledger: Arc<dyn OffsetAcknowledger>) -> Self {
        Self {
            event,
            offset,
            acknowledger,
        }
    }

    /// Mark this event (and every event before it) as consumed.
    pub async fn ack(&self) -> Result<(), EngineError> {
        self.acknowledger.acknowledge(self.offset).await
    }
}

impl std::fmt::Debug for StreamedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedEvent")
            .field("event", &self.event)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Mediates every read and write of one workflow instance.
///
/// Transitions are delegated to the shared [`ExecutionState`]; each backend
/// supplies correlation and event publication, and may decorate the
/// workflow-level transitions.
pub trait WorkflowExecutionContext: Send + Sync {
    fn state(&self) -> &ExecutionState;

    /// Resolve the context for a blocking `listen` task.
    fn correlate<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, Result<CorrelationContext, EngineError>>;

    /// Lazily deliver correlated events until the correlation completes or
    /// `cancellation` fires.
    fn stream<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxStream<'a, Result<StreamedEvent, EngineError>>;

    /// Publish an event emitted by the workflow.
    fn publish(&self, event: CloudEvent) -> BoxFuture<'_, Result<(), EngineError>>;

    fn definition(&self) -> &WorkflowDefinition {
        self.state().definition()
    }

    fn config(&self) -> &EngineConfig {
        self.state().config()
    }

    fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.state().evaluator()
    }

    /// The `workflow` argument exposed to runtime expressions.
    fn descriptor(&self) -> &Value {
        self.state().descriptor()
    }

    /// A copy of the current snapshot. Never hold it across a transition.
    fn instance(&self) -> BoxFuture<'_, WorkflowInstance> {
        Box::pin(self.state().snapshot())
    }

    fn get_document<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Value, EngineError>> {
        Box::pin(self.state().get_document(id))
    }

    fn context_data(&self) -> BoxFuture<'_, Result<Value, EngineError>> {
        Box::pin(self.state().context_data())
    }

    fn set_context_data(&self, data: Value) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().set_context_data(data))
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().initialize())
    }

    fn start(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().start())
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().resume())
    }

    fn suspend(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().suspend())
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().cancel())
    }

    fn set_result(&self, output: Value) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().set_result(output))
    }

    fn set_error(&self, error: ErrorDetails) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.state().set_error(error))
    }

    fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> BoxFuture<'_, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().create_task(request))
    }

    fn get_task<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().get_task(id))
    }

    /// Every task when `parent_id` is `None`, otherwise its direct children.
    fn get_tasks<'a>(&'a self, parent_id: Option<&'a str>) -> BoxStream<'a, TaskInstance> {
        self.state().get_tasks(parent_id)
    }

    fn start_task<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().start_task(id))
    }

    fn retry_task<'a>(
        &'a self,
        id: &'a str,
        cause: ErrorDetails,
    ) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().retry_task(id, cause))
    }

    fn skip_task<'a>(
        &'a self,
        id: &'a str,
        output: Value,
    ) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().skip_task(id, output))
    }

    fn suspend_task<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().suspend_task(id))
    }

    fn cancel_task<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().cancel_task(id))
    }

    fn set_task_error<'a>(
        &'a self,
        id: &'a str,
        error: ErrorDetails,
    ) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().set_task_error(id, error))
    }

    fn set_task_result<'a>(
        &'a self,
        id: &'a str,
        output: Value,
        then: FlowDirective,
    ) -> BoxFuture<'a, Result<TaskInstance, EngineError>> {
        Box::pin(self.state().set_task_result(id, output, then))
    }
}
