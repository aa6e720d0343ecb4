//! Single owner of a workflow instance snapshot.
//!
//! Every transition locks the snapshot, mutates a copy, persists it through
//! the configured [`InstancePersistence`] and assigns the persisted result
//! back before the lock is released. No two transitions are ever computed
//! against the same base snapshot.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use weft_types::config::EngineConfig;
use weft_types::correlation::CorrelationContext;
use weft_types::definition::{FlowDirective, WorkflowDefinition};
use weft_types::error::ErrorDetails;
use weft_types::event::{
    CloudEvent, LIFECYCLE_EVENT_SOURCE, LifecycleEventKind, TaskLifecycleEventData,
    WorkflowLifecycleEventData,
};
use weft_types::instance::{
    RetryAttempt, RunInfo, TaskInstance, TaskInstanceStatus, WorkflowInstance,
    WorkflowInstanceStatusPhase,
};

use crate::repository::{CloudEventPublisherDyn, DocumentRepositoryDyn};

use super::context::{CreateTaskRequest, task_reference};
use super::error::EngineError;
use super::expression::{ExpressionEvaluator, evaluate_template};

/// Where a transitioned snapshot is written.
pub trait InstancePersistence: Send + Sync {
    /// Persist `next` (derived from `previous`) and return the stored state.
    fn persist<'a>(
        &'a self,
        previous: &'a WorkflowInstance,
        next: &'a WorkflowInstance,
    ) -> BoxFuture<'a, Result<WorkflowInstance, EngineError>>;
}

/// Shared transition logic behind both execution-context backends.
pub struct ExecutionState {
    definition: Arc<WorkflowDefinition>,
    config: EngineConfig,
    evaluator: Arc<dyn ExpressionEvaluator>,
    documents: Arc<dyn DocumentRepositoryDyn>,
    persistence: Box<dyn InstancePersistence>,
    lifecycle: Option<Arc<dyn CloudEventPublisherDyn>>,
    /// `name.namespace` of the instance; immutable for its lifetime.
    qualified_name: String,
    descriptor: Value,
    instance: Mutex<WorkflowInstance>,
    /// Serializes creation of the workflow context document.
    context_document: Mutex<()>,
}

impl ExecutionState {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        instance: WorkflowInstance,
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
        documents: Arc<dyn DocumentRepositoryDyn>,
        persistence: Box<dyn InstancePersistence>,
    ) -> Self {
        let descriptor = json!({
            "id": instance.metadata.name,
            "namespace": instance.metadata.namespace,
            "definition": {
                "namespace": definition.document.namespace,
                "name": definition.document.name,
                "version": definition.document.version,
            },
            "input": instance.spec.input.clone().unwrap_or(Value::Null),
        });
        Self {
            definition,
            config,
            evaluator,
            documents,
            persistence,
            lifecycle: None,
            qualified_name: instance.qualified_name(),
            descriptor,
            instance: Mutex::new(instance),
            context_document: Mutex::new(()),
        }
    }

    /// Publish lifecycle events through `publisher` when enabled in config.
    pub fn with_lifecycle_publisher(mut self, publisher: Arc<dyn CloudEventPublisherDyn>) -> Self {
        if self.config.lifecycle_events {
            self.lifecycle = Some(publisher);
        }
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }

    pub fn documents(&self) -> &Arc<dyn DocumentRepositoryDyn> {
        &self.documents
    }

    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub async fn snapshot(&self) -> WorkflowInstance {
        self.instance.lock().await.clone()
    }

    /// Lock, mutate a copy, persist, assign back.
    ///
    /// Nothing is persisted when `mutate` leaves the snapshot unchanged.
    async fn transition<T, F>(&self, mutate: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let mut current = self.instance.lock().await;
        let mut next = current.clone();
        let value = mutate(&mut next)?;
        if next != *current {
            let persisted = self.persistence.persist(&current, &next).await?;
            *current = persisted;
        }
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub async fn get_document(&self, id: &str) -> Result<Value, EngineError> {
        Ok(self.documents.get_boxed(id).await?)
    }

    /// Workflow-scoped context data; `{}` until the context document exists.
    pub async fn context_data(&self) -> Result<Value, EngineError> {
        let reference = self.instance.lock().await.status.context_reference.clone();
        match reference {
            Some(id) => self.get_document(&id).await,
            None => Ok(Value::Object(Map::new())),
        }
    }

    pub async fn set_context_data(&self, data: Value) -> Result<(), EngineError> {
        let id = self.ensure_context_document().await?;
        self.documents.update_boxed(&id, &data).await?;
        Ok(())
    }

    async fn ensure_context_document(&self) -> Result<String, EngineError> {
        let _creating = self.context_document.lock().await;
        if let Some(id) = self.instance.lock().await.status.context_reference.clone() {
            return Ok(id);
        }
        let created = self
            .documents
            .create_boxed(&format!("{}/context", self.qualified_name), &json!({}))
            .await?;
        self.transition(move |instance| {
            Ok(instance
                .status
                .context_reference
                .get_or_insert(created)
                .clone())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Workflow transitions
    // -----------------------------------------------------------------------

    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.ensure_context_document().await?;
        debug!(workflow = %self.qualified_name, "workflow initialized");
        self.publish_workflow_event(LifecycleEventKind::Created, None)
            .await;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.ensure_context_document().await?;
        let now = Utc::now();
        let started = self
            .transition(|instance| {
                if instance.status.phase != WorkflowInstanceStatusPhase::Pending {
                    return Ok(false);
                }
                instance.status.phase = WorkflowInstanceStatusPhase::Running;
                instance.status.runs.push(RunInfo {
                    started_at: now,
                    ended_at: None,
                });
                Ok(true)
            })
            .await?;
        if started {
            debug!(workflow = %self.qualified_name, "workflow started");
            self.publish_workflow_event(LifecycleEventKind::Started, None)
                .await;
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_context_document().await?;
        let now = Utc::now();
        let resumed = self
            .transition(|instance| {
                if instance.status.phase.is_terminal() {
                    return Ok(false);
                }
                // A run left open by an interrupted process ends here.
                instance.status.close_run(now);
                instance.status.phase = WorkflowInstanceStatusPhase::Running;
                instance.status.runs.push(RunInfo {
                    started_at: now,
                    ended_at: None,
                });
                Ok(true)
            })
            .await?;
        if resumed {
            debug!(workflow = %self.qualified_name, "workflow resumed");
            self.publish_workflow_event(LifecycleEventKind::Resumed, None)
                .await;
        }
        Ok(())
    }

    pub async fn suspend(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let suspended = self
            .transition(|instance| {
                let phase = instance.status.phase;
                if phase.is_terminal() || phase == WorkflowInstanceStatusPhase::Suspended {
                    return Ok(false);
                }
                instance.status.close_run(now);
                instance.status.phase = WorkflowInstanceStatusPhase::Suspended;
                Ok(true)
            })
            .await?;
        if suspended {
            debug!(workflow = %self.qualified_name, "workflow suspended");
            self.publish_workflow_event(LifecycleEventKind::Suspended, None)
                .await;
        }
        Ok(())
    }

    pub async fn cancel(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let cancelled = self
            .transition(|instance| {
                if instance.status.phase.is_terminal() {
                    return Ok(false);
                }
                instance.status.close_run(now);
                instance.status.phase = WorkflowInstanceStatusPhase::Cancelled;
                Ok(true)
            })
            .await?;
        if cancelled {
            debug!(workflow = %self.qualified_name, "workflow cancelled");
            self.publish_workflow_event(LifecycleEventKind::Cancelled, None)
                .await;
            self.publish_workflow_event(LifecycleEventKind::Ended, None)
                .await;
        }
        Ok(())
    }

    pub async fn set_result(&self, output: Value) -> Result<(), EngineError> {
        if self.instance.lock().await.status.phase.is_terminal() {
            return Ok(());
        }
        let output_reference = self
            .documents
            .create_boxed(&format!("{}/output", self.qualified_name), &output)
            .await?;
        let now = Utc::now();
        let completed = self
            .transition(|instance| {
                if instance.status.phase.is_terminal() {
                    return Ok(false);
                }
                instance.status.close_run(now);
                instance.status.phase = WorkflowInstanceStatusPhase::Completed;
                instance.status.output_reference = Some(output_reference);
                Ok(true)
            })
            .await?;
        if completed {
            debug!(workflow = %self.qualified_name, "workflow completed");
            self.publish_workflow_event(LifecycleEventKind::Completed, None)
                .await;
            self.publish_workflow_event(LifecycleEventKind::Ended, None)
                .await;
        }
        Ok(())
    }

    pub async fn set_error(&self, error: ErrorDetails) -> Result<(), EngineError> {
        let now = Utc::now();
        let recorded = error.clone();
        let faulted = self
            .transition(move |instance| {
                if instance.status.phase.is_terminal() {
                    return Ok(false);
                }
                instance.status.close_run(now);
                instance.status.phase = WorkflowInstanceStatusPhase::Faulted;
                instance.status.error = Some(recorded);
                Ok(true)
            })
            .await?;
        if faulted {
            debug!(workflow = %self.qualified_name, error = %error, "workflow faulted");
            self.publish_workflow_event(LifecycleEventKind::Faulted, Some(&error))
                .await;
            self.publish_workflow_event(LifecycleEventKind::Ended, Some(&error))
                .await;
        }
        Ok(())
    }

    /// Move between `Running` and `Waiting` while a correlation is pending.
    pub async fn set_phase(&self, phase: WorkflowInstanceStatusPhase) -> Result<(), EngineError> {
        self.transition(|instance| {
            if !instance.status.phase.is_terminal() {
                instance.status.phase = phase;
            }
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Correlation contexts
    // -----------------------------------------------------------------------

    pub async fn correlation_context(&self, reference: &str) -> Option<CorrelationContext> {
        self.instance
            .lock()
            .await
            .status
            .correlation
            .contexts
            .get(reference)
            .cloned()
    }

    /// Record a resolved correlation and leave the `Waiting` phase.
    pub async fn record_correlation(
        &self,
        reference: &str,
        context: CorrelationContext,
    ) -> Result<(), EngineError> {
        let reference = reference.to_string();
        self.transition(move |instance| {
            instance.status.correlation.contexts.insert(reference, context);
            if instance.status.phase == WorkflowInstanceStatusPhase::Waiting {
                instance.status.phase = WorkflowInstanceStatusPhase::Running;
            }
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<TaskInstance, EngineError> {
        let CreateTaskRequest {
            name,
            definition,
            path,
            input,
            context,
            parent,
            is_extension,
        } = request;
        let reference = task_reference(parent.as_ref(), &path);

        let (context_reference, context_data) = match context {
            Some(data) => {
                let id = self
                    .documents
                    .create_boxed(&format!("{reference}/context"), &data)
                    .await?;
                (id, data)
            }
            None => {
                let id = match parent.as_ref().and_then(|p| p.context_reference.clone()) {
                    Some(id) => id,
                    None => self.ensure_context_document().await?,
                };
                let data = self.get_document(&id).await?;
                (id, data)
            }
        };

        let input = match definition.input.as_ref().and_then(|i| i.from.as_ref()) {
            Some(filter) => {
                let mut arguments = Map::new();
                arguments.insert("context".to_string(), context_data);
                arguments.insert("input".to_string(), input.clone());
                arguments.insert("workflow".to_string(), self.descriptor.clone());
                evaluate_template(self.evaluator(), filter, &input, &arguments)?
            }
            None => input,
        };
        let input_reference = self
            .documents
            .create_boxed(&format!("{reference}/input"), &input)
            .await?;

        let mut task = TaskInstance::new(name, reference, parent.map(|p| p.id), is_extension);
        task.input_reference = Some(input_reference);
        task.context_reference = Some(context_reference);

        let created = task.clone();
        self.transition(move |instance| {
            instance.status.tasks.push(created);
            Ok(())
        })
        .await?;

        debug!(
            workflow = %self.qualified_name,
            task_id = %task.id,
            reference = %task.reference,
            "task created"
        );
        self.publish_task_event(LifecycleEventKind::Created, &task)
            .await;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<TaskInstance, EngineError> {
        self.instance
            .lock()
            .await
            .status
            .task(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub fn get_tasks<'a>(&'a self, parent_id: Option<&'a str>) -> BoxStream<'a, TaskInstance> {
        Box::pin(async_stream::stream! {
            let tasks: Vec<TaskInstance> = {
                let instance = self.instance.lock().await;
                match parent_id {
                    Some(parent_id) => instance.status.children(parent_id).cloned().collect(),
                    None => instance.status.tasks.clone(),
                }
            };
            for task in tasks {
                yield task;
            }
        })
    }

    pub async fn start_task(&self, id: &str) -> Result<TaskInstance, EngineError> {
        let now = Utc::now();
        let (task, kind) = self
            .transition(|instance| {
                let task = task_mut(instance, id)?;
                if task.status.is_terminal() {
                    return Ok((task.clone(), None));
                }
                let kind = match task.status {
                    TaskInstanceStatus::Pending => LifecycleEventKind::Started,
                    _ => LifecycleEventKind::Resumed,
                };
                task.close_run(now, TaskInstanceStatus::Suspended);
                task.status = TaskInstanceStatus::Running;
                task.started_at.get_or_insert(now);
                task.begin_run(now);
                Ok((task.clone(), Some(kind)))
            })
            .await?;
        if let Some(kind) = kind {
            self.log_task_transition(&task, kind);
            self.publish_task_event(kind, &task).await;
        }
        Ok(task)
    }

    pub async fn retry_task(&self, id: &str, cause: ErrorDetails) -> Result<TaskInstance, EngineError> {
        let now = Utc::now();
        let (task, retried) = self
            .transition(|instance| {
                let task = task_mut(instance, id)?;
                if task.status != TaskInstanceStatus::Running {
                    return Ok((task.clone(), false));
                }
                task.close_run(now, TaskInstanceStatus::Faulted);
                let number = task.retries.len() as u32 + 1;
                task.retries.push(RetryAttempt {
                    number,
                    at: now,
                    cause: Some(cause),
                });
                task.begin_run(now);
                Ok((task.clone(), true))
            })
            .await?;
        if retried {
            self.log_task_transition(&task, LifecycleEventKind::Retrying);
            self.publish_task_event(LifecycleEventKind::Retrying, &task)
                .await;
        }
        Ok(task)
    }

    pub async fn skip_task(&self, id: &str, output: Value) -> Result<TaskInstance, EngineError> {
        let current = self.get_task(id).await?;
        if !current.is_operative() {
            return Ok(current);
        }
        let output_reference = self
            .documents
            .create_boxed(&format!("{}/output", current.reference), &output)
            .await?;
        let now = Utc::now();
        self.finish_task(id, LifecycleEventKind::Skipped, |task| {
            if !task.is_operative() {
                return false;
            }
            task.close_run(now, TaskInstanceStatus::Skipped);
            task.status = TaskInstanceStatus::Skipped;
            task.ended_at = Some(now);
            task.output_reference = Some(output_reference);
            task.next = Some(FlowDirective::Continue);
            true
        })
        .await
    }

    pub async fn suspend_task(&self, id: &str) -> Result<TaskInstance, EngineError> {
        let now = Utc::now();
        let (task, suspended) = self
            .transition(|instance| {
                let task = task_mut(instance, id)?;
                if !task.is_operative() || task.status == TaskInstanceStatus::Suspended {
                    return Ok((task.clone(), false));
                }
                task.close_run(now, TaskInstanceStatus::Suspended);
                task.status = TaskInstanceStatus::Suspended;
                Ok((task.clone(), true))
            })
            .await?;
        if suspended {
            self.log_task_transition(&task, LifecycleEventKind::Suspended);
            self.publish_task_event(LifecycleEventKind::Suspended, &task)
                .await;
        }
        Ok(task)
    }

    pub async fn cancel_task(&self, id: &str) -> Result<TaskInstance, EngineError> {
        let now = Utc::now();
        self.finish_task(id, LifecycleEventKind::Cancelled, |task| {
            if !task.is_operative() {
                return false;
            }
            task.close_run(now, TaskInstanceStatus::Cancelled);
            task.status = TaskInstanceStatus::Cancelled;
            task.ended_at = Some(now);
            true
        })
        .await
    }

    pub async fn set_task_error(&self, id: &str, error: ErrorDetails) -> Result<TaskInstance, EngineError> {
        let now = Utc::now();
        self.finish_task(id, LifecycleEventKind::Faulted, |task| {
            if !task.is_operative() {
                return false;
            }
            task.close_run(now, TaskInstanceStatus::Faulted);
            task.status = TaskInstanceStatus::Faulted;
            task.ended_at = Some(now);
            task.error = Some(error);
            true
        })
        .await
    }

    /// No-op unless the task is `Running`.
    pub async fn set_task_result(
        &self,
        id: &str,
        output: Value,
        then: FlowDirective,
    ) -> Result<TaskInstance, EngineError> {
        let current = self.get_task(id).await?;
        if current.status != TaskInstanceStatus::Running {
            debug!(
                task_id = %id,
                status = %current.status,
                "ignoring result for a task that is not running"
            );
            return Ok(current);
        }
        let output_reference = self
            .documents
            .create_boxed(&format!("{}/output", current.reference), &output)
            .await?;
        let now = Utc::now();
        self.finish_task(id, LifecycleEventKind::Completed, |task| {
            if task.status != TaskInstanceStatus::Running {
                return false;
            }
            task.close_run(now, TaskInstanceStatus::Completed);
            task.status = TaskInstanceStatus::Completed;
            task.ended_at = Some(now);
            task.output_reference = Some(output_reference);
            task.next = Some(then);
            true
        })
        .await
    }

    /// Apply a terminal transition and publish it with a paired `Ended` event.
    async fn finish_task<F>(
        &self,
        id: &str,
        kind: LifecycleEventKind,
        apply: F,
    ) -> Result<TaskInstance, EngineError>
    where
        F: FnOnce(&mut TaskInstance) -> bool + Send,
    {
        let (task, changed) = self
            .transition(|instance| {
                let task = task_mut(instance, id)?;
                let changed = apply(task);
                Ok((task.clone(), changed))
            })
            .await?;
        if changed {
            self.log_task_transition(&task, kind);
            self.publish_task_event(kind, &task).await;
            self.publish_task_event(LifecycleEventKind::Ended, &task)
                .await;
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    fn log_task_transition(&self, task: &TaskInstance, kind: LifecycleEventKind) {
        debug!(
            workflow = %self.qualified_name,
            task_id = %task.id,
            reference = %task.reference,
            status = %task.status,
            transition = kind.as_str(),
            "task transition"
        );
    }

    async fn publish_workflow_event(&self, kind: LifecycleEventKind, error: Option<&ErrorDetails>) {
        let Some(publisher) = &self.lifecycle else {
            return;
        };
        let data = WorkflowLifecycleEventData {
            workflow: self.qualified_name.clone(),
            definition: self.definition.qualified_name(),
            at: Utc::now(),
            error: error.cloned(),
        };
        let event = match serde_json::to_value(&data) {
            Ok(data) => CloudEvent::new(LIFECYCLE_EVENT_SOURCE, kind.workflow_event_type())
                .with_subject(self.qualified_name.clone())
                .with_data(data),
            Err(e) => {
                warn!(error = %e, "failed to serialize workflow lifecycle event");
                return;
            }
        };
        if let Err(e) = publisher.publish_boxed(&event).await {
            warn!(
                workflow = %self.qualified_name,
                event_type = %event.type_,
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }

    async fn publish_task_event(&self, kind: LifecycleEventKind, task: &TaskInstance) {
        let Some(publisher) = &self.lifecycle else {
            return;
        };
        let data = TaskLifecycleEventData {
            workflow: self.qualified_name.clone(),
            task: task.id.clone(),
            reference: task.reference.clone(),
            at: Utc::now(),
            error: task.error.clone(),
        };
        let event = match serde_json::to_value(&data) {
            Ok(data) => CloudEvent::new(LIFECYCLE_EVENT_SOURCE, kind.task_event_type())
                .with_subject(format!("{}.{}", task.id, self.qualified_name))
                .with_data(data),
            Err(e) => {
                warn!(error = %e, "failed to serialize task lifecycle event");
                return;
            }
        };
        if let Err(e) = publisher.publish_boxed(&event).await {
            warn!(
                task_id = %task.id,
                event_type = %event.type_,
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }
}

fn task_mut<'a>(instance: &'a mut WorkflowInstance, id: &str) -> Result<&'a mut TaskInstance, EngineError> {
    instance
        .status
        .task_mut(id)
        .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
}
