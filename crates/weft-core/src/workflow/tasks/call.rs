//! `call`: invoke a registered function.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use weft_types::definition::CallTaskDefinition;
use weft_types::error::ErrorDetails;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_template;
use crate::workflow::functions::FunctionRegistry;

pub struct CallTaskBehavior {
    definition: CallTaskDefinition,
    functions: FunctionRegistry,
}

impl CallTaskBehavior {
    pub fn new(definition: CallTaskDefinition, functions: FunctionRegistry) -> Self {
        Self {
            definition,
            functions,
        }
    }
}

impl TaskBehavior for CallTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let name = &self.definition.call;
            let Some(handler) = self.functions.get(name) else {
                return Ok(StepResult::Fault(
                    ErrorDetails::configuration(format!("unknown function '{name}'"))
                        .with_instance(executor.reference()),
                ));
            };

            let arguments = match &self.definition.with {
                Some(with) => {
                    let expression_arguments = executor.context().arguments();
                    evaluate_template(executor.evaluator(), with, &input, &expression_arguments)?
                }
                None => input,
            };

            debug!(function = %name, reference = %executor.reference(), "calling function");
            tokio::select! {
                _ = executor.scope().cancelled() => Ok(StepResult::Cancel),
                result = handler.call(arguments) => match result {
                    Ok(output) => Ok(StepResult::complete(output)),
                    Err(error) => {
                        let error = match error.instance {
                            Some(_) => error,
                            None => error.with_instance(executor.reference()),
                        };
                        Ok(StepResult::Fault(error))
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use weft_types::definition::{TaskDefinition, TaskList};
    use weft_types::error::{ErrorDetails, error_types};
    use weft_types::instance::WorkflowInstanceStatusPhase;

    use crate::event::CloudEventBus;
    use crate::workflow::functions::FunctionRegistry;
    use crate::workflow::tasks::testing::{definition, run_definition, run_workflow};

    #[tokio::test]
    async fn test_call_passes_evaluated_arguments() {
        let tasks = TaskList::new().with(
            "shout",
            TaskDefinition::call("echo", Some(json!({"message": "${ data.text | upper }"}))),
        );
        let run = run_workflow(tasks, json!({"text": "hi"})).await;
        assert_eq!(run.output, Some(json!({"message": "HI"})));
    }

    #[tokio::test]
    async fn test_unknown_function_is_a_configuration_fault() {
        let tasks = TaskList::new().with("missing", TaskDefinition::call("nope", None));
        let run = run_workflow(tasks, json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(
            run.instance.status.error.unwrap().type_,
            error_types::CONFIGURATION
        );
    }

    #[tokio::test]
    async fn test_handler_error_faults_task() {
        let functions = FunctionRegistry::new();
        functions.register("reject", |_: Value| async move {
            Err::<Value, _>(ErrorDetails::communication("upstream unavailable"))
        });
        let tasks = TaskList::new().with("remote", TaskDefinition::call("reject", None));
        let run = run_definition(definition(tasks), json!({}), functions, CloudEventBus::new(8)).await;

        let error = run.instance.status.error.unwrap();
        assert_eq!(error.type_, error_types::COMMUNICATION);
        assert_eq!(error.instance.as_deref(), Some("/do/0/remote"));
    }
}
