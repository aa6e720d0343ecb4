//! `set`: produce a value, usually built from runtime expressions.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::definition::SetTaskDefinition;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_template;

pub struct SetTaskBehavior {
    definition: SetTaskDefinition,
}

impl SetTaskBehavior {
    pub fn new(definition: SetTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for SetTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let arguments = executor.context().arguments();
            let output =
                evaluate_template(executor.evaluator(), &self.definition.set, &input, &arguments)?;
            Ok(StepResult::complete(output))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::definition::{TaskDefinition, TaskList};
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use crate::workflow::tasks::testing::{run_workflow, task_by_name};

    #[tokio::test]
    async fn test_set_evaluates_templates_against_input() {
        let tasks = TaskList::new().with(
            "greet",
            TaskDefinition::set(json!({"greeting": "hello", "who": "${ data.name }"})),
        );
        let run = run_workflow(tasks, json!({"name": "ada"})).await;
        assert_eq!(run.output, Some(json!({"greeting": "hello", "who": "ada"})));
    }

    #[tokio::test]
    async fn test_falsy_if_skips_and_passes_input_through() {
        let tasks = TaskList::new()
            .with(
                "guarded",
                TaskDefinition::set(json!({"replaced": true})).with_if("${ data.enabled }"),
            )
            .with("next", TaskDefinition::set(json!("${ data }")));
        let run = run_workflow(tasks, json!({"enabled": false})).await;

        assert_eq!(task_by_name(&run.instance, "guarded").status, TaskInstanceStatus::Skipped);
        assert_eq!(run.output, Some(json!({"enabled": false})));
    }

    #[tokio::test]
    async fn test_export_updates_workflow_context() {
        let tasks = TaskList::new()
            .with(
                "remember",
                TaskDefinition::set(json!({"user": "ada"}))
                    .with_export_as(json!({"user": "${ data.user }"})),
            )
            .with("recall", TaskDefinition::set(json!("${ context.user }")));
        let run = run_workflow(tasks, json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!("ada")));
    }

    #[tokio::test]
    async fn test_output_filter_applies_before_next_task() {
        let tasks = TaskList::new()
            .with(
                "fetch",
                TaskDefinition::set(json!({"body": {"id": "42"}})).with_output_as(json!("${ data.body }")),
            )
            .with("next", TaskDefinition::set(json!("${ data.id }")));
        let run = run_workflow(tasks, json!({})).await;
        assert_eq!(run.output, Some(json!("42")));
    }
}
