//! `try`: run a task list and handle its faults with retries or a
//! compensating list.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;
use weft_types::definition::{ErrorCatcherDefinition, TryTaskDefinition};
use weft_types::error::ErrorDetails;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_condition;
use crate::workflow::sequence::{SequenceOutcome, run_sequence};

const DEFAULT_ERROR_VARIABLE: &str = "error";

pub struct TryTaskBehavior {
    definition: TryTaskDefinition,
}

impl TryTaskBehavior {
    pub fn new(definition: TryTaskDefinition) -> Self {
        Self { definition }
    }

    fn error_variable(&self) -> &str {
        self.definition
            .catch
            .as_
            .as_deref()
            .unwrap_or(DEFAULT_ERROR_VARIABLE)
    }

    /// Whether the catcher handles `error`.
    fn catches(&self, executor: &TaskExecutor, error: &ErrorDetails) -> Result<bool, EngineError> {
        let catch: &ErrorCatcherDefinition = &self.definition.catch;
        if let Some(filter) = catch.errors.as_ref().and_then(|e| e.with.as_ref()) {
            if filter.type_.as_ref().is_some_and(|t| *t != error.type_) {
                return Ok(false);
            }
            if filter.status.is_some_and(|s| s != error.status) {
                return Ok(false);
            }
        }

        let data = serde_json::to_value(error)?;
        let mut arguments = executor.context().arguments();
        arguments.insert(self.error_variable().to_string(), data.clone());
        if let Some(when) = &catch.when {
            if !evaluate_condition(executor.evaluator(), when, &data, &arguments)? {
                return Ok(false);
            }
        }
        if let Some(except_when) = &catch.except_when {
            if evaluate_condition(executor.evaluator(), except_when, &data, &arguments)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle(
        &self,
        executor: &Arc<TaskExecutor>,
        input: Value,
        error: ErrorDetails,
        retried: bool,
    ) -> Result<StepResult, EngineError> {
        let Some(tasks) = &self.definition.catch.do_ else {
            return Ok(if retried {
                StepResult::Fault(error)
            } else {
                StepResult::complete(input)
            });
        };

        let mut context = match executor.context().context_data() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        context.insert(self.error_variable().to_string(), serde_json::to_value(&error)?);
        let outcome = run_sequence(executor, tasks, "catch/do", input, Some(Value::Object(context)))
            .await?;
        Ok(outcome.into_step_result(executor.instance().is_extension))
    }
}

impl TaskBehavior for TryTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            loop {
                let outcome =
                    run_sequence(&executor, &self.definition.try_, "try", input.clone(), None)
                        .await?;
                let error = match outcome {
                    SequenceOutcome::Faulted(error) => error,
                    other => return Ok(other.into_step_result(executor.instance().is_extension)),
                };

                if !self.catches(&executor, &error)? {
                    return Ok(StepResult::Fault(error));
                }

                let Some(retry) = &self.definition.catch.retry else {
                    return self.handle(&executor, input, error, false).await;
                };
                let attempt = executor.instance().retries.len() as u32 + 1;
                if retry.max_attempts().is_some_and(|max| attempt > max) {
                    debug!(reference = %executor.reference(), attempt, "retries exhausted");
                    return self.handle(&executor, input, error, true).await;
                }

                let delay = retry.delay_for(attempt);
                tokio::select! {
                    _ = executor.scope().cancelled() => return Ok(StepResult::Cancel),
                    _ = tokio::time::sleep(delay) => {}
                }
                executor.record_retry(error).await?;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{Value, json};
    use weft_types::definition::{
        DurationDefinition, ErrorCatcherDefinition, ErrorDefinition, ErrorFilterDefinition,
        ErrorFilterProperties, RetryAttemptLimit, RetryLimitDefinition, RetryPolicyDefinition,
        TaskDefinition, TaskKind, TaskList, TryTaskDefinition,
    };
    use weft_types::error::{ErrorDetails, error_types};
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use crate::event::CloudEventBus;
    use crate::workflow::functions::FunctionRegistry;
    use crate::workflow::tasks::testing::{definition, run_definition, run_workflow, task_by_name};

    fn try_task(tasks: TaskList, catch: ErrorCatcherDefinition) -> TaskDefinition {
        TaskDefinition::new(TaskKind::Try(TryTaskDefinition { try_: tasks, catch }))
    }

    fn retry_up_to(count: u32) -> RetryPolicyDefinition {
        RetryPolicyDefinition {
            delay: Some(DurationDefinition::from_millis(1)),
            backoff: None,
            limit: Some(RetryLimitDefinition {
                attempt: Some(RetryAttemptLimit { count: Some(count) }),
            }),
        }
    }

    fn flaky(failures: u32) -> (FunctionRegistry, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let functions = FunctionRegistry::new();
        let counter = Arc::clone(&calls);
        functions.register("flaky", move |arguments: Value| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(ErrorDetails::communication("temporarily unavailable"))
                } else {
                    Ok(arguments)
                }
            }
        });
        (functions, calls)
    }

    #[tokio::test]
    async fn test_retry_until_success_records_attempts() {
        let (functions, calls) = flaky(2);
        let tasks = TaskList::new().with(
            "guarded",
            try_task(
                TaskList::new().with("remote", TaskDefinition::call("flaky", None)),
                ErrorCatcherDefinition {
                    retry: Some(retry_up_to(3)),
                    ..Default::default()
                },
            ),
        );
        let run = run_definition(definition(tasks), json!({"id": "7"}), functions, CloudEventBus::new(8))
            .await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!({"id": "7"})));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let guarded = task_by_name(&run.instance, "guarded");
        assert_eq!(guarded.retries.len(), 2);
        assert_eq!(guarded.runs.len(), 1 + guarded.retries.len());
        assert_eq!(
            guarded.retries.iter().map(|r| r.number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let attempts: Vec<_> = run
            .instance
            .status
            .tasks
            .iter()
            .filter(|t| t.name == "remote")
            .collect();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].status, TaskInstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fault() {
        let (functions, calls) = flaky(10);
        let tasks = TaskList::new().with(
            "guarded",
            try_task(
                TaskList::new().with("remote", TaskDefinition::call("flaky", None)),
                ErrorCatcherDefinition {
                    retry: Some(retry_up_to(2)),
                    ..Default::default()
                },
            ),
        );
        let run =
            run_definition(definition(tasks), json!({}), functions, CloudEventBus::new(8)).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            run.instance.status.error.unwrap().type_,
            error_types::COMMUNICATION
        );
    }

    #[tokio::test]
    async fn test_catch_do_binds_error() {
        let tasks = TaskList::new().with(
            "guarded",
            try_task(
                TaskList::new().with(
                    "fail",
                    TaskDefinition::raise(ErrorDefinition {
                        type_: "https://example.com/errors/declined".into(),
                        status: 402,
                        title: Some("Payment declined".into()),
                        detail: None,
                    }),
                ),
                ErrorCatcherDefinition {
                    as_: Some("failure".into()),
                    do_: Some(TaskList::new().with(
                        "compensate",
                        TaskDefinition::set(json!({"handled": "${ context.failure.title }"})),
                    )),
                    ..Default::default()
                },
            ),
        );
        let run = run_workflow(tasks, json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!({"handled": "Payment declined"})));
        assert_eq!(
            task_by_name(&run.instance, "fail").status,
            TaskInstanceStatus::Faulted
        );
    }

    #[tokio::test]
    async fn test_unmatched_error_propagates() {
        let tasks = TaskList::new().with(
            "guarded",
            try_task(
                TaskList::new().with(
                    "fail",
                    TaskDefinition::raise(ErrorDefinition {
                        type_: "https://example.com/errors/other".into(),
                        status: 500,
                        title: None,
                        detail: None,
                    }),
                ),
                ErrorCatcherDefinition {
                    errors: Some(ErrorFilterDefinition {
                        with: Some(ErrorFilterProperties {
                            type_: Some("https://example.com/errors/declined".into()),
                            status: None,
                        }),
                    }),
                    ..Default::default()
                },
            ),
        );
        let run = run_workflow(tasks, json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(
            run.instance.status.error.unwrap().instance.as_deref(),
            Some("/do/0/guarded/try/0/fail")
        );
    }
}
