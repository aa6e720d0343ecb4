//! `for`: run the `do` list once per item of a collection.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use weft_types::definition::{FlowDirective, ForTaskDefinition};
use weft_types::error::ErrorDetails;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::{evaluate_condition, evaluate_expression};
use crate::workflow::sequence::{SequenceOutcome, run_sequence};

pub struct ForTaskBehavior {
    definition: ForTaskDefinition,
}

impl ForTaskBehavior {
    pub fn new(definition: ForTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for ForTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let each = &self.definition.for_.each;
            let at = &self.definition.for_.at;
            let arguments = executor.context().arguments();

            let items = match evaluate_expression(
                executor.evaluator(),
                &self.definition.for_.in_,
                &input,
                &arguments,
            )? {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Ok(StepResult::Fault(ErrorDetails::validation(format!(
                        "'for.in' must produce an array, got {other}"
                    ))));
                }
            };
            let limit = self.definition.for_.limit.unwrap_or(usize::MAX);
            let base_context = executor.context().context_data();

            let mut output = input;
            for (index, item) in items.into_iter().take(limit).enumerate() {
                let mut context = match &base_context {
                    Value::Object(fields) => fields.clone(),
                    _ => Map::new(),
                };
                context.insert(each.clone(), item.clone());
                context.insert(at.clone(), json!(index));

                if let Some(condition) = &self.definition.while_ {
                    let mut scope = arguments.clone();
                    scope.insert("context".to_string(), Value::Object(context.clone()));
                    scope.insert(each.clone(), item.clone());
                    scope.insert(at.clone(), json!(index));
                    if !evaluate_condition(executor.evaluator(), condition, &item, &scope)? {
                        break;
                    }
                }

                let path = format!("for/{index}/do");
                match run_sequence(
                    &executor,
                    &self.definition.do_,
                    &path,
                    item,
                    Some(Value::Object(context)),
                )
                .await?
                {
                    SequenceOutcome::Completed { output: last, directive } => {
                        output = last;
                        match directive {
                            FlowDirective::End => {
                                return Ok(StepResult::Complete {
                                    output,
                                    then: Some(FlowDirective::End),
                                });
                            }
                            FlowDirective::Exit => break,
                            _ => {}
                        }
                    }
                    SequenceOutcome::Faulted(error) => return Ok(StepResult::Fault(error)),
                    SequenceOutcome::Cancelled => return Ok(StepResult::Cancel),
                    SequenceOutcome::Suspended => return Ok(StepResult::Suspend),
                }
            }
            Ok(StepResult::complete(output))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::definition::{
        ForLoopDefinition, ForTaskDefinition, TaskDefinition, TaskKind, TaskList,
    };
    use weft_types::instance::WorkflowInstanceStatusPhase;

    use crate::workflow::tasks::testing::run_workflow;

    fn for_task(in_: &str, limit: Option<usize>, do_: TaskList) -> TaskDefinition {
        TaskDefinition::new(TaskKind::For(ForTaskDefinition {
            for_: ForLoopDefinition {
                each: "color".into(),
                in_: in_.into(),
                at: "position".into(),
                limit,
            },
            while_: None,
            do_,
        }))
    }

    #[tokio::test]
    async fn test_iterates_with_loop_variables_in_context() {
        let body = TaskList::new().with(
            "paint",
            TaskDefinition::set(json!({"color": "${ context.color }", "at": "${ context.position }"})),
        );
        let run = run_workflow(
            TaskList::new().with("loop", for_task("${ data.colors }", None, body)),
            json!({"colors": ["red", "green", "blue"]}),
        )
        .await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!({"color": "blue", "at": 2})));
        let references: Vec<&str> = run
            .instance
            .status
            .tasks
            .iter()
            .filter(|t| t.name == "paint")
            .map(|t| t.reference.as_str())
            .collect();
        assert_eq!(
            references,
            vec![
                "/do/0/loop/for/0/do/0/paint",
                "/do/0/loop/for/1/do/0/paint",
                "/do/0/loop/for/2/do/0/paint",
            ]
        );
    }

    #[tokio::test]
    async fn test_limit_caps_iterations() {
        let body = TaskList::new().with("paint", TaskDefinition::set(json!("${ context.color }")));
        let run = run_workflow(
            TaskList::new().with("loop", for_task("data.colors", Some(2), body)),
            json!({"colors": ["red", "green", "blue"]}),
        )
        .await;

        assert_eq!(run.output, Some(json!("green")));
        let iterations = run.instance.status.tasks.iter().filter(|t| t.name == "paint").count();
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn test_empty_collection_passes_input_through() {
        let body = TaskList::new().with("paint", TaskDefinition::set(json!("never")));
        let run = run_workflow(
            TaskList::new().with("loop", for_task("${ data.colors }", None, body)),
            json!({"colors": []}),
        )
        .await;

        assert_eq!(run.output, Some(json!({"colors": []})));
    }
}
