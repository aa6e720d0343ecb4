//! `switch`: pick a flow directive from the first matching case.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use weft_types::definition::SwitchTaskDefinition;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_condition;

pub struct SwitchTaskBehavior {
    definition: SwitchTaskDefinition,
}

impl SwitchTaskBehavior {
    pub fn new(definition: SwitchTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for SwitchTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let arguments = executor.context().arguments();
            for (name, case) in self.definition.switch.iter() {
                let matched = match &case.when {
                    Some(condition) => {
                        evaluate_condition(executor.evaluator(), condition, &input, &arguments)?
                    }
                    None => true,
                };
                if matched {
                    debug!(case = name, then = %case.then, "switch case matched");
                    return Ok(StepResult::Complete {
                        output: input,
                        then: Some(case.then.clone()),
                    });
                }
            }
            Ok(StepResult::complete(input))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::definition::{
        FlowDirective, NamedList, SwitchCaseDefinition, SwitchTaskDefinition, TaskDefinition,
        TaskKind, TaskList,
    };

    use crate::workflow::tasks::testing::run_workflow;

    fn router() -> TaskList {
        let cases = NamedList::new()
            .with(
                "express",
                SwitchCaseDefinition {
                    when: Some("data.priority == 'high'".into()),
                    then: FlowDirective::Goto("fast".into()),
                },
            )
            .with(
                "fallback",
                SwitchCaseDefinition {
                    when: None,
                    then: FlowDirective::Goto("slow".into()),
                },
            );
        TaskList::new()
            .with(
                "route",
                TaskDefinition::new(TaskKind::Switch(SwitchTaskDefinition { switch: cases })),
            )
            .with("slow", TaskDefinition::set(json!({"lane": "slow"})).with_then("end"))
            .with("fast", TaskDefinition::set(json!({"lane": "fast"})))
    }

    #[tokio::test]
    async fn test_first_matching_case_wins() {
        let run = run_workflow(router(), json!({"priority": "high"})).await;
        assert_eq!(run.output, Some(json!({"lane": "fast"})));
    }

    #[tokio::test]
    async fn test_default_case() {
        let run = run_workflow(router(), json!({"priority": "low"})).await;
        assert_eq!(run.output, Some(json!({"lane": "slow"})));
    }
}
