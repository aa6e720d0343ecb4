//! Top-level workflow executor.
//!
//! Runs the definition's `do` list against an execution context, maps task
//! outcomes onto workflow transitions and enforces the workflow timeout and
//! cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_types::definition::FlowDirective;
use weft_types::error::ErrorDetails;
use weft_types::instance::WorkflowInstanceStatusPhase;

use super::context::WorkflowExecutionContext;
use super::error::EngineError;
use super::executor::{ChildSpec, TaskExecutor, TaskOutcome};
use super::expression::evaluate_template;
use super::factory::TaskExecutorFactory;

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed(Value),
    Faulted(ErrorDetails),
    Cancelled,
    Suspended,
}

pub struct WorkflowExecutor {
    context: Arc<dyn WorkflowExecutionContext>,
    factory: TaskExecutorFactory,
    cancellation: CancellationToken,
    current: Mutex<Option<Arc<TaskExecutor>>>,
}

impl WorkflowExecutor {
    pub fn new(context: Arc<dyn WorkflowExecutionContext>, factory: TaskExecutorFactory) -> Self {
        Self {
            context,
            factory,
            cancellation: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<dyn WorkflowExecutionContext> {
        &self.context
    }

    /// Token that cancels the whole run when triggered.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Run (or resume) the workflow to an outcome.
    ///
    /// An instance that is already terminal returns its recorded outcome.
    pub async fn execute(&self) -> Result<WorkflowOutcome, EngineError> {
        let instance = self.context.instance().await;
        if instance.status.phase.is_terminal() {
            return self.recorded_outcome().await;
        }
        if instance.status.phase == WorkflowInstanceStatusPhase::Pending {
            self.context.initialize().await?;
            self.context.start().await?;
        } else {
            self.context.resume().await?;
        }
        info!(workflow = %instance.metadata.qualified_name(), "workflow running");

        let timeout = self
            .context
            .definition()
            .timeout
            .as_ref()
            .map(|timeout| timeout.after.to_duration());

        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => self.cancel_run().await,
            _ = sleep_or_pending(timeout) => {
                self.time_out(timeout.unwrap_or_default()).await
            }
            result = self.run() => result,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "workflow execution failed");
                let error = e.to_error_details();
                self.context.set_error(error.clone()).await?;
                Ok(WorkflowOutcome::Faulted(error))
            }
        }
    }

    /// Suspend the task currently running, then the workflow.
    pub async fn suspend(&self) -> Result<(), EngineError> {
        if let Some(task) = self.current_task() {
            task.suspend().await?;
        }
        self.context.suspend().await
    }

    /// Request cancellation; [`execute`](Self::execute) returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn current_task(&self) -> Option<Arc<TaskExecutor>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, task: Option<Arc<TaskExecutor>>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = task;
    }

    async fn run(&self) -> Result<WorkflowOutcome, EngineError> {
        let definition = self.context.definition();
        let arguments = self.arguments().await?;
        let raw_input = self.context.descriptor()["input"].clone();
        let input = match definition.input.as_ref().and_then(|i| i.from.as_ref()) {
            Some(filter) => evaluate_template(self.context.evaluator(), filter, &raw_input, &arguments)?,
            None => raw_input,
        };

        let tasks = &definition.do_;
        let mut visits: HashMap<String, usize> = HashMap::new();
        let mut index = 0;
        let mut current = input;

        while let Some((name, task)) = tasks.get(index) {
            let occurrence = visits.entry(name.to_string()).or_insert(0);
            let spec = ChildSpec {
                name: name.to_string(),
                definition: task.clone(),
                path: format!("do/{index}/{name}"),
                input: current.clone(),
                context: None,
                is_extension: false,
            };
            let executor = self
                .factory
                .materialize(
                    Arc::clone(&self.context),
                    None,
                    spec,
                    *occurrence,
                    &self.cancellation,
                    false,
                )
                .await?;
            *occurrence += 1;

            self.set_current(Some(Arc::clone(&executor)));
            let outcome = executor.execute().await;
            self.set_current(None);

            match outcome? {
                TaskOutcome::Completed { output, then } => {
                    current = output;
                    match then {
                        FlowDirective::Continue => index += 1,
                        FlowDirective::Goto(target) => {
                            index = tasks.position(&target).ok_or_else(|| {
                                EngineError::Configuration(format!(
                                    "task '{name}' transitions to unknown task '{target}'"
                                ))
                            })?;
                        }
                        FlowDirective::End | FlowDirective::Exit => break,
                    }
                }
                TaskOutcome::Skipped { output } => {
                    current = output;
                    index += 1;
                }
                TaskOutcome::Faulted(error) => {
                    self.context.set_error(error.clone()).await?;
                    return Ok(WorkflowOutcome::Faulted(error));
                }
                TaskOutcome::Cancelled => {
                    self.context.cancel().await?;
                    return Ok(WorkflowOutcome::Cancelled);
                }
                TaskOutcome::Suspended => {
                    self.context.suspend().await?;
                    return Ok(WorkflowOutcome::Suspended);
                }
            }
        }

        let output = match definition.output.as_ref().and_then(|o| o.as_.as_ref()) {
            Some(filter) => {
                let mut arguments = self.arguments().await?;
                arguments.insert("output".to_string(), current.clone());
                evaluate_template(self.context.evaluator(), filter, &current, &arguments)?
            }
            None => current,
        };
        self.context.set_result(output.clone()).await?;
        debug!("workflow completed");
        Ok(WorkflowOutcome::Completed(output))
    }

    async fn arguments(&self) -> Result<Map<String, Value>, EngineError> {
        let mut arguments = Map::new();
        arguments.insert("context".to_string(), self.context.context_data().await?);
        arguments.insert("input".to_string(), self.context.descriptor()["input"].clone());
        arguments.insert("workflow".to_string(), self.context.descriptor().clone());
        Ok(arguments)
    }

    async fn cancel_run(&self) -> Result<WorkflowOutcome, EngineError> {
        if let Some(task) = self.current_task() {
            task.cancel().await?;
        }
        self.context.cancel().await?;
        Ok(WorkflowOutcome::Cancelled)
    }

    async fn time_out(&self, after: Duration) -> Result<WorkflowOutcome, EngineError> {
        debug!(?after, "workflow timed out");
        let error = EngineError::Timeout(after).to_error_details();
        if let Some(task) = self.current_task() {
            task.set_error(error.clone().with_instance(task.reference()))
                .await?;
        }
        self.context.set_error(error.clone()).await?;
        Ok(WorkflowOutcome::Faulted(error))
    }

    async fn recorded_outcome(&self) -> Result<WorkflowOutcome, EngineError> {
        let instance = self.context.instance().await;
        Ok(match instance.status.phase {
            WorkflowInstanceStatusPhase::Completed => {
                let output = match &instance.status.output_reference {
                    Some(id) => self.context.get_document(id).await?,
                    None => Value::Null,
                };
                WorkflowOutcome::Completed(output)
            }
            WorkflowInstanceStatusPhase::Faulted => WorkflowOutcome::Faulted(
                instance
                    .status
                    .error
                    .unwrap_or_else(|| ErrorDetails::runtime("workflow faulted without details")),
            ),
            WorkflowInstanceStatusPhase::Suspended => WorkflowOutcome::Suspended,
            _ => WorkflowOutcome::Cancelled,
        })
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;
    use weft_types::config::EngineConfig;
    use weft_types::definition::{
        DurationDefinition, ExtensionDefinition, NamedList, TaskDefinition, TaskList,
        TimeoutDefinition, WorkflowDefinition,
    };
    use weft_types::error::error_types;
    use weft_types::event::LifecycleEventKind;
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use super::*;
    use crate::repository::memory::MemoryCloudEventPublisher;
    use crate::workflow::functions::FunctionRegistry;
    use crate::workflow::standalone::StandaloneWorkflowContext;
    use crate::workflow::tasks::testing::{definition, run_workflow, task_by_name, wait_for_phase};

    fn executor(definition: WorkflowDefinition, input: Value) -> Arc<WorkflowExecutor> {
        let context = StandaloneWorkflowContext::builder(definition).input(input).build();
        Arc::new(WorkflowExecutor::new(
            context,
            TaskExecutorFactory::new(FunctionRegistry::with_builtins()),
        ))
    }

    #[tokio::test]
    async fn test_completed_run_records_output_and_single_run() {
        let tasks = TaskList::new()
            .with("first", TaskDefinition::set(json!({"step": "one"})))
            .with("second", TaskDefinition::set(json!({"previous": "${ data.step }"})));
        let run = run_workflow(tasks, json!({})).await;

        assert_eq!(run.outcome, WorkflowOutcome::Completed(json!({"previous": "one"})));
        assert_eq!(run.instance.status.runs.len(), 1);
        assert!(run.instance.status.runs[0].ended_at.is_some());
        assert!(
            run.instance
                .status
                .tasks
                .iter()
                .all(|t| t.status == TaskInstanceStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_input_and_output_filters() {
        let mut definition = definition(
            TaskList::new().with("echo", TaskDefinition::set(json!({"seen": "${ data }"}))),
        );
        definition.input = Some(weft_types::definition::InputDefinition {
            from: Some(json!("${ data.order }")),
        });
        definition.output = Some(weft_types::definition::OutputDefinition {
            as_: Some(json!("${ data.seen }")),
        });
        let outcome = executor(definition, json!({"order": "A-7", "noise": "x"}))
            .execute()
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed(json!("A-7")));
    }

    #[tokio::test]
    async fn test_workflow_timeout_faults_running_task() {
        let mut definition = definition(TaskList::new().with(
            "stall",
            TaskDefinition::wait(DurationDefinition::from_secs(3600)),
        ));
        definition.timeout = Some(TimeoutDefinition {
            after: DurationDefinition::from_millis(20),
        });
        let executor = executor(definition, json!({}));
        let outcome = tokio::time::timeout(Duration::from_secs(2), executor.execute())
            .await
            .expect("workflow timeout did not fire")
            .unwrap();

        let WorkflowOutcome::Faulted(error) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.type_, error_types::TIMEOUT);
        let instance = executor.context().instance().await;
        assert_eq!(instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(task_by_name(&instance, "stall").status, TaskInstanceStatus::Faulted);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_task() {
        let executor = executor(
            definition(TaskList::new().with(
                "stall",
                TaskDefinition::wait(DurationDefinition::from_secs(3600)),
            )),
            json!({}),
        );
        let running = Arc::clone(&executor);
        let handle = tokio::spawn(async move { running.execute().await });
        let context = Arc::clone(executor.context());
        wait_for_phase(context.as_ref(), WorkflowInstanceStatusPhase::Running).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        executor.cancel();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        let instance = executor.context().instance().await;
        assert_eq!(instance.status.phase, WorkflowInstanceStatusPhase::Cancelled);
        assert_eq!(task_by_name(&instance, "stall").status, TaskInstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_re_executing_terminal_instance_is_idempotent() {
        let sink = Arc::new(MemoryCloudEventPublisher::new());
        let context = StandaloneWorkflowContext::builder(definition(
            TaskList::new().with("only", TaskDefinition::set(json!({"v": "1"}))),
        ))
        .sink(sink.clone())
        .build();
        let executor = WorkflowExecutor::new(
            context,
            TaskExecutorFactory::new(FunctionRegistry::with_builtins()),
        );
        let first = executor.execute().await.unwrap();
        let tasks_before = executor.context().instance().await.status.tasks.len();
        let events_before = sink.event_types();
        assert!(!events_before.is_empty());

        let second = executor.execute().await.unwrap();

        assert_eq!(first, second);
        let instance = executor.context().instance().await;
        assert_eq!(instance.status.tasks.len(), tasks_before);
        assert_eq!(instance.status.runs.len(), 1);
        assert_eq!(sink.event_types(), events_before);
    }

    #[tokio::test]
    async fn test_suspend_then_resume_reuses_task_instances() {
        let executor = executor(
            definition(
                TaskList::new()
                    .with("prepare", TaskDefinition::set(json!({"ready": "yes"})))
                    .with("pause", TaskDefinition::wait(DurationDefinition::from_millis(200)))
                    .with("finish", TaskDefinition::set(json!({"done": "${ data.ready }"}))),
            ),
            json!({}),
        );
        let running = Arc::clone(&executor);
        let handle = tokio::spawn(async move { running.execute().await });
        let context = Arc::clone(executor.context());
        loop {
            let instance = context.instance().await;
            if instance.status.tasks.iter().any(|t| t.name == "pause" && t.status == TaskInstanceStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        executor.suspend().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), WorkflowOutcome::Suspended);
        let suspended = context.instance().await;
        assert_eq!(suspended.status.phase, WorkflowInstanceStatusPhase::Suspended);
        assert_eq!(task_by_name(&suspended, "pause").status, TaskInstanceStatus::Suspended);

        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed(json!({"done": "yes"})));

        let instance = context.instance().await;
        assert_eq!(instance.status.runs.len(), 2);
        let ids: HashSet<_> = instance.status.tasks.iter().map(|t| t.reference.clone()).collect();
        assert_eq!(ids.len(), instance.status.tasks.len(), "a task was created twice");
        let pause = task_by_name(&instance, "pause");
        assert_eq!(pause.status, TaskInstanceStatus::Completed);
        assert_eq!(pause.runs.len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_paired_and_ordered() {
        let sink = Arc::new(MemoryCloudEventPublisher::new());
        let context = StandaloneWorkflowContext::builder(definition(
            TaskList::new().with("only", TaskDefinition::set(json!({}))),
        ))
        .config(EngineConfig {
            lifecycle_events: true,
            ..EngineConfig::default()
        })
        .sink(sink.clone())
        .build();
        let executor = WorkflowExecutor::new(context, TaskExecutorFactory::default());
        executor.execute().await.unwrap();

        assert_eq!(
            sink.event_types(),
            vec![
                LifecycleEventKind::Created.workflow_event_type(),
                LifecycleEventKind::Started.workflow_event_type(),
                LifecycleEventKind::Created.task_event_type(),
                LifecycleEventKind::Started.task_event_type(),
                LifecycleEventKind::Completed.task_event_type(),
                LifecycleEventKind::Ended.task_event_type(),
                LifecycleEventKind::Completed.workflow_event_type(),
                LifecycleEventKind::Ended.workflow_event_type(),
            ]
        );
    }

    #[tokio::test]
    async fn test_lifecycle_events_can_be_disabled() {
        let sink = Arc::new(MemoryCloudEventPublisher::new());
        let context = StandaloneWorkflowContext::builder(definition(
            TaskList::new().with("only", TaskDefinition::set(json!({}))),
        ))
        .config(EngineConfig {
            lifecycle_events: false,
            ..EngineConfig::default()
        })
        .sink(sink.clone())
        .build();
        WorkflowExecutor::new(context, TaskExecutorFactory::default())
            .execute()
            .await
            .unwrap();
        assert!(sink.event_types().is_empty());
    }

    #[tokio::test]
    async fn test_extension_hooks_wrap_matching_tasks() {
        let mut definition = definition(
            TaskList::new()
                .with("compute", TaskDefinition::set(json!({"value": "${ data.seed }"})))
                .with("pause", TaskDefinition::wait(DurationDefinition::from_millis(0))),
        );
        definition.use_ = Some(weft_types::definition::ComponentCollection {
            extensions: Some(NamedList::new().with(
                "audit",
                ExtensionDefinition {
                    extend: "set".into(),
                    when: None,
                    before: Some(TaskList::new().with(
                        "seed",
                        TaskDefinition::set(json!({"seed": "from-hook"})),
                    )),
                    after: Some(TaskList::new().with(
                        "stamp",
                        TaskDefinition::set(json!({"value": "${ data.value }", "audited": true})),
                    )),
                },
            )),
        });
        let executor = executor(definition, json!({}));
        let outcome = executor.execute().await.unwrap();

        assert_eq!(
            outcome,
            WorkflowOutcome::Completed(json!({"value": "from-hook", "audited": true}))
        );
        let instance = executor.context().instance().await;
        let references: Vec<_> = instance
            .status
            .tasks
            .iter()
            .filter(|t| t.is_extension)
            .map(|t| t.reference.clone())
            .collect();
        assert_eq!(
            references,
            vec![
                "/do/0/compute/extensions/audit/before",
                "/do/0/compute/extensions/audit/after",
            ]
        );
        // Tasks inside hooks are not hooked again.
        assert_eq!(
            instance.status.tasks.iter().filter(|t| t.name == "seed").count(),
            1
        );
    }
}
