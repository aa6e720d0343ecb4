//! `do`: run child tasks one after another.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::definition::DoTaskDefinition;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::sequence::run_sequence;

pub struct DoTaskBehavior {
    definition: DoTaskDefinition,
}

impl DoTaskBehavior {
    pub fn new(definition: DoTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for DoTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let outcome = run_sequence(&executor, &self.definition.do_, "do", input, None).await?;
            Ok(outcome.into_step_result(executor.instance().is_extension))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::definition::{ErrorDefinition, TaskDefinition, TaskList};
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use crate::workflow::tasks::testing::{run_workflow, task_by_name};

    #[tokio::test]
    async fn test_output_of_one_step_is_input_of_next() {
        let tasks = TaskList::new()
            .with("first", TaskDefinition::set(json!({"a": 1})))
            .with(
                "second",
                TaskDefinition::set(json!("${ data }")).with_input_from(json!("${ data }")),
            );
        let run = run_workflow(TaskList::new().with("block", TaskDefinition::do_(tasks)), json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        let second = task_by_name(&run.instance, "second");
        let input = run.document(second.input_reference.as_deref().unwrap()).await;
        assert_eq!(input, json!({"a": 1}));
        assert_eq!(run.output, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_fault_stops_remaining_children() {
        let tasks = TaskList::new()
            .with("ok", TaskDefinition::set(json!({"step": 1})))
            .with(
                "boom",
                TaskDefinition::raise(ErrorDefinition {
                    type_: "https://example.com/errors/boom".into(),
                    status: 400,
                    title: Some("Boom".into()),
                    detail: None,
                }),
            )
            .with("never", TaskDefinition::set(json!({"step": 3})));
        let run = run_workflow(TaskList::new().with("block", TaskDefinition::do_(tasks)), json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        let error = run.instance.status.error.as_ref().unwrap();
        assert_eq!(error.type_, "https://example.com/errors/boom");
        assert_eq!(error.instance.as_deref(), Some("/do/0/block/do/1/boom"));
        assert_eq!(task_by_name(&run.instance, "block").status, TaskInstanceStatus::Faulted);
        assert!(run.instance.status.tasks.iter().all(|t| t.name != "never"));
    }

    #[tokio::test]
    async fn test_goto_and_end_directives() {
        let tasks = TaskList::new()
            .with("start", TaskDefinition::set(json!({"at": "start"})).with_then("finish"))
            .with("skipped", TaskDefinition::set(json!({"at": "skipped"})))
            .with("finish", TaskDefinition::set(json!({"at": "finish"})).with_then("end"));
        let outer = TaskList::new()
            .with("block", TaskDefinition::do_(tasks))
            .with("after", TaskDefinition::set(json!({"at": "after"})));
        let run = run_workflow(outer, json!({})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!({"at": "finish"})));
        let names: Vec<&str> = run.instance.status.tasks.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains(&"skipped"));
        assert!(!names.contains(&"after"));
    }
}
