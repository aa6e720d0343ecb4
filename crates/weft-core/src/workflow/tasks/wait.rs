//! `wait`: pause for a fixed duration, passing the input through.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::definition::WaitTaskDefinition;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};

pub struct WaitTaskBehavior {
    definition: WaitTaskDefinition,
}

impl WaitTaskBehavior {
    pub fn new(definition: WaitTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for WaitTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let duration = self.definition.wait.to_duration();
            tokio::select! {
                _ = executor.scope().cancelled() => Ok(StepResult::Cancel),
                _ = tokio::time::sleep(duration) => Ok(StepResult::complete(input)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use weft_types::definition::{DurationDefinition, TaskDefinition, TaskList};
    use weft_types::error::error_types;
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use crate::workflow::tasks::testing::{run_workflow, task_by_name};

    #[tokio::test]
    async fn test_zero_wait_completes_with_input() {
        let tasks = TaskList::new().with("pause", TaskDefinition::wait(DurationDefinition::from_millis(0)));
        let run = run_workflow(tasks, json!({"keep": "me"})).await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(run.output, Some(json!({"keep": "me"})));
    }

    #[tokio::test]
    async fn test_timeout_faults_task_promptly() {
        let tasks = TaskList::new().with(
            "stuck",
            TaskDefinition::wait(DurationDefinition::from_secs(3600))
                .with_timeout(DurationDefinition::from_millis(10)),
        );
        let started = Instant::now();
        let run = run_workflow(tasks, json!({})).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        let stuck = task_by_name(&run.instance, "stuck");
        assert_eq!(stuck.status, TaskInstanceStatus::Faulted);
        let error = stuck.error.as_ref().unwrap();
        assert_eq!(error.type_, error_types::TIMEOUT);
        assert_eq!(error.instance.as_deref(), Some("/do/0/stuck"));
        let task_time = (stuck.ended_at.unwrap() - stuck.started_at.unwrap())
            .to_std()
            .unwrap();
        assert!(task_time <= Duration::from_millis(250), "task ran {task_time:?}");

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(run.instance.status.error.as_ref().unwrap().type_, error_types::TIMEOUT);
    }
}
