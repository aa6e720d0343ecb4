//! Per-task view of the workflow execution context.

use std::sync::{Arc, RwLock};

use futures_util::stream::BoxStream;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use weft_types::correlation::CorrelationContext;
use weft_types::definition::{FlowDirective, ListenerDefinition, TaskDefinition};
use weft_types::error::ErrorDetails;
use weft_types::instance::TaskInstance;

use super::context::{StreamedEvent, WorkflowExecutionContext};
use super::error::EngineError;

/// Narrows a [`WorkflowExecutionContext`] to one task instance.
///
/// Every lifecycle call goes through the workflow context and replaces the
/// cached instance with the canonical one it returns.
pub struct TaskExecutionContext {
    workflow: Arc<dyn WorkflowExecutionContext>,
    name: String,
    definition: TaskDefinition,
    instance: RwLock<TaskInstance>,
    input: Value,
    context_data: RwLock<Value>,
}

impl TaskExecutionContext {
    /// Load the input and context documents of `instance`.
    pub async fn load(
        workflow: Arc<dyn WorkflowExecutionContext>,
        name: String,
        definition: TaskDefinition,
        instance: TaskInstance,
    ) -> Result<Self, EngineError> {
        let input = match &instance.input_reference {
            Some(id) => workflow.get_document(id).await?,
            None => Value::Null,
        };
        let context_data = match &instance.context_reference {
            Some(id) => workflow.get_document(id).await?,
            None => workflow.context_data().await?,
        };
        Ok(Self {
            workflow,
            name,
            definition,
            instance: RwLock::new(instance),
            input,
            context_data: RwLock::new(context_data),
        })
    }

    pub fn workflow(&self) -> &Arc<dyn WorkflowExecutionContext> {
        &self.workflow
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    /// Last instance returned by the workflow context.
    pub fn instance(&self) -> TaskInstance {
        self.instance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn context_data(&self) -> Value {
        self.context_data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Named arguments for runtime expressions evaluated within this task.
    pub fn arguments(&self) -> Map<String, Value> {
        let instance = self.instance();
        let mut arguments = Map::new();
        arguments.insert("context".to_string(), self.context_data());
        arguments.insert("input".to_string(), self.input.clone());
        arguments.insert("workflow".to_string(), self.workflow.descriptor().clone());
        arguments.insert(
            "task".to_string(),
            json!({
                "id": instance.id,
                "name": self.name,
                "reference": instance.reference,
            }),
        );
        arguments
    }

    /// The persisted output, once the task has completed or been skipped.
    pub async fn output(&self) -> Result<Option<Value>, EngineError> {
        match self.instance().output_reference {
            Some(id) => Ok(Some(self.workflow.get_document(&id).await?)),
            None => Ok(None),
        }
    }

    fn store(&self, instance: TaskInstance) -> TaskInstance {
        let mut cached = self
            .instance
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = instance.clone();
        instance
    }

    /// Re-read the canonical instance from the workflow context.
    pub async fn refresh(&self) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.get_task(&id).await?;
        Ok(self.store(instance))
    }

    pub async fn initialize(&self) -> Result<TaskInstance, EngineError> {
        self.refresh().await
    }

    /// Transition to `Running`.
    pub async fn execute(&self) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.start_task(&id).await?;
        Ok(self.store(instance))
    }

    pub async fn skip(&self, output: Value) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.skip_task(&id, output).await?;
        Ok(self.store(instance))
    }

    pub async fn suspend(&self) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.suspend_task(&id).await?;
        Ok(self.store(instance))
    }

    pub async fn retry(&self, cause: ErrorDetails) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.retry_task(&id, cause).await?;
        Ok(self.store(instance))
    }

    pub async fn set_error(&self, error: ErrorDetails) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.set_task_error(&id, error).await?;
        Ok(self.store(instance))
    }

    pub async fn set_result(
        &self,
        output: Value,
        then: FlowDirective,
    ) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.set_task_result(&id, output, then).await?;
        Ok(self.store(instance))
    }

    pub async fn cancel(&self) -> Result<TaskInstance, EngineError> {
        let id = self.instance().id;
        let instance = self.workflow.cancel_task(&id).await?;
        Ok(self.store(instance))
    }

    /// Export `data` as the workflow context.
    pub async fn set_context_data(&self, data: Value) -> Result<(), EngineError> {
        self.workflow.set_context_data(data.clone()).await?;
        let mut cached = self
            .context_data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = data;
        Ok(())
    }

    pub async fn correlate(
        &self,
        listener: &ListenerDefinition,
        cancellation: CancellationToken,
    ) -> Result<CorrelationContext, EngineError> {
        let instance = self.instance();
        self.workflow
            .correlate(&instance, listener, cancellation)
            .await
    }

    pub fn stream<'a>(
        &'a self,
        instance: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxStream<'a, Result<StreamedEvent, EngineError>> {
        self.workflow.stream(instance, listener, cancellation)
    }
}
