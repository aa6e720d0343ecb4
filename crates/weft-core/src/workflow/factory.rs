//! Maps task kinds to behaviors and materializes executors.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use weft_types::definition::{TaskDefinition, TaskKind};
use weft_types::instance::TaskInstance;

use super::context::{CreateTaskRequest, WorkflowExecutionContext, task_reference};
use super::error::EngineError;
use super::executor::{ChildSpec, TaskBehavior, TaskExecutor};
use super::functions::FunctionRegistry;
use super::task_context::TaskExecutionContext;
use super::tasks;

/// Builds task executors. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutorFactory {
    functions: FunctionRegistry,
}

impl TaskExecutorFactory {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// The behavior implementing `definition`'s kind.
    pub fn behavior_for(&self, definition: &TaskDefinition) -> Box<dyn TaskBehavior> {
        match &definition.kind {
            TaskKind::Call(call) => Box::new(tasks::call::CallTaskBehavior::new(
                call.clone(),
                self.functions.clone(),
            )),
            TaskKind::Do(task) => Box::new(tasks::sequential::DoTaskBehavior::new(task.clone())),
            TaskKind::Fork(task) => Box::new(tasks::concurrent::ForkTaskBehavior::new(task.clone())),
            TaskKind::For(task) => Box::new(tasks::for_each::ForTaskBehavior::new(task.clone())),
            TaskKind::Switch(task) => Box::new(tasks::switch::SwitchTaskBehavior::new(task.clone())),
            TaskKind::Raise(task) => Box::new(tasks::raise::RaiseTaskBehavior::new(task.clone())),
            TaskKind::Set(task) => Box::new(tasks::set::SetTaskBehavior::new(task.clone())),
            TaskKind::Wait(task) => Box::new(tasks::wait::WaitTaskBehavior::new(task.clone())),
            TaskKind::Emit(task) => Box::new(tasks::emit::EmitTaskBehavior::new(task.clone())),
            TaskKind::Listen(task) => Box::new(tasks::listen::ListenTaskBehavior::new(task.clone())),
            TaskKind::Try(task) => Box::new(tasks::try_catch::TryTaskBehavior::new(task.clone())),
        }
    }

    /// Create (or, on re-entry, reuse) the task instance for `spec` and wrap
    /// it in an initialized executor.
    ///
    /// The `occurrence`-th existing instance with the same reference under
    /// the same parent is reused. Instances created before the parent's last
    /// retry belong to an earlier attempt and are ignored.
    pub async fn materialize(
        &self,
        workflow: Arc<dyn WorkflowExecutionContext>,
        parent: Option<&TaskInstance>,
        spec: ChildSpec,
        occurrence: usize,
        parent_scope: &CancellationToken,
        in_extension: bool,
    ) -> Result<Arc<TaskExecutor>, EngineError> {
        let reference = task_reference(parent, &spec.path);
        let parent_id = parent.map(|p| p.id.clone());
        let cutoff = parent.and_then(TaskInstance::last_retried_at);

        let existing = {
            let candidates: Vec<TaskInstance> = workflow
                .get_tasks(parent_id.as_deref())
                .filter(|task| {
                    let same = task.reference == reference
                        && task.parent_id == parent_id
                        && cutoff.is_none_or(|at| task.created_at >= at);
                    std::future::ready(same)
                })
                .collect()
                .await;
            candidates.into_iter().nth(occurrence)
        };

        let instance = match existing {
            Some(instance) => instance,
            None => {
                workflow
                    .create_task(CreateTaskRequest {
                        name: spec.name.clone(),
                        definition: spec.definition.clone(),
                        path: spec.path.clone(),
                        input: spec.input.clone(),
                        context: spec.context.clone(),
                        parent: parent.cloned(),
                        is_extension: spec.is_extension,
                    })
                    .await?
            }
        };

        let behavior = self.behavior_for(&spec.definition);
        let context = TaskExecutionContext::load(workflow, spec.name, spec.definition, instance).await?;
        let executor = TaskExecutor::new(
            context,
            behavior,
            self.clone(),
            parent_scope.child_token(),
            in_extension || spec.is_extension,
        );
        executor.initialize().await?;
        Ok(executor)
    }
}
