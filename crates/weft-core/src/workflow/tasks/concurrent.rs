//! `fork`: run branches concurrently.
//!
//! Without `compete`, every branch must finish; the first fault cancels the
//! remaining branches and faults the fork. With `compete`, the first branch
//! to complete wins and the others are cancelled.

use std::sync::Arc;

use futures_util::future::{BoxFuture, try_join_all};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;
use weft_types::definition::ForkTaskDefinition;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{ChildSpec, StepResult, TaskBehavior, TaskExecutor, TaskOutcome};

pub struct ForkTaskBehavior {
    definition: ForkTaskDefinition,
}

impl ForkTaskBehavior {
    pub fn new(definition: ForkTaskDefinition) -> Self {
        Self { definition }
    }

    async fn spawn_branches(
        &self,
        executor: &Arc<TaskExecutor>,
        input: &Value,
    ) -> Result<(Vec<Arc<TaskExecutor>>, JoinSet<(usize, Result<TaskOutcome, EngineError>)>), EngineError>
    {
        let creations = self
            .definition
            .fork
            .branches
            .iter()
            .enumerate()
            .map(|(index, (name, definition))| {
                executor.create_child(
                    ChildSpec {
                        name: name.to_string(),
                        definition: definition.clone(),
                        path: format!("fork/branches/{index}/{name}"),
                        input: input.clone(),
                        context: None,
                        is_extension: false,
                    },
                    0,
                )
            });
        let branches = try_join_all(creations).await?;

        let mut running = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let execution = branch.execute();
            running.spawn(async move { (index, execution.await) });
        }
        Ok((branches, running))
    }
}

impl TaskBehavior for ForkTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let (branches, mut running) = self.spawn_branches(&executor, &input).await?;
            let compete = self.definition.fork.compete;
            let mut outputs: Vec<Value> = vec![Value::Null; branches.len()];
            let mut suspended = false;
            let mut settled: Option<Result<StepResult, EngineError>> = None;

            while let Some(joined) = running.join_next().await {
                let (index, outcome) =
                    joined.map_err(|e| EngineError::Runtime(format!("fork branch panicked: {e}")))?;
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        cancel_others(&branches, index).await?;
                        settled = Some(Err(e));
                        break;
                    }
                };
                match outcome {
                    TaskOutcome::Completed { output, .. } | TaskOutcome::Skipped { output } => {
                        if compete {
                            debug!(branch = index, "fork branch won");
                            cancel_others(&branches, index).await?;
                            settled = Some(Ok(StepResult::complete(output)));
                            break;
                        }
                        outputs[index] = output;
                    }
                    TaskOutcome::Faulted(error) => {
                        debug!(branch = index, error = %error, "fork branch faulted, cancelling siblings");
                        cancel_others(&branches, index).await?;
                        settled = Some(Ok(StepResult::Fault(error)));
                        break;
                    }
                    TaskOutcome::Cancelled => {
                        cancel_others(&branches, index).await?;
                        settled = Some(Ok(StepResult::Cancel));
                        break;
                    }
                    TaskOutcome::Suspended => suspended = true,
                }
            }

            // Cancelled branches release their latches; wait for them to settle.
            while running.join_next().await.is_some() {}

            if let Some(result) = settled {
                return result;
            }
            if suspended {
                return Ok(StepResult::Suspend);
            }
            Ok(StepResult::complete(Value::Array(outputs)))
        })
    }
}

async fn cancel_others(branches: &[Arc<TaskExecutor>], winner: usize) -> Result<(), EngineError> {
    for (index, branch) in branches.iter().enumerate() {
        if index != winner && !branch.is_released() {
            branch.cancel().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use weft_types::definition::{DurationDefinition, ErrorDefinition, TaskDefinition, TaskList};
    use weft_types::instance::{TaskInstanceStatus, WorkflowInstanceStatusPhase};

    use crate::workflow::tasks::testing::{run_workflow, task_by_name};

    fn slow_set(millis: u64, value: serde_json::Value) -> TaskDefinition {
        TaskDefinition::do_(
            TaskList::new()
                .with("pause", TaskDefinition::wait(DurationDefinition::from_millis(millis)))
                .with("produce", TaskDefinition::set(value)),
        )
    }

    #[tokio::test]
    async fn test_branches_run_concurrently_in_declaration_order() {
        let branches = TaskList::new()
            .with("left", slow_set(150, json!("left")))
            .with("right", slow_set(150, json!("right")));
        let started = Instant::now();
        let run = run_workflow(
            TaskList::new().with("split", TaskDefinition::fork(branches, false)),
            json!({}),
        )
        .await;

        assert!(started.elapsed() < Duration::from_millis(290), "branches ran sequentially");
        assert_eq!(run.output, Some(json!(["left", "right"])));

        let left = task_by_name(&run.instance, "left");
        let right = task_by_name(&run.instance, "right");
        assert_ne!(left.id, right.id);
        assert_eq!(left.reference, "/do/0/split/fork/branches/0/left");
        assert_eq!(right.reference, "/do/0/split/fork/branches/1/right");
    }

    #[tokio::test]
    async fn test_fault_cancels_sibling_branches() {
        let branches = TaskList::new()
            .with("slow", TaskDefinition::wait(DurationDefinition::from_secs(3600)))
            .with(
                "broken",
                TaskDefinition::raise(ErrorDefinition {
                    type_: "https://example.com/errors/broken".into(),
                    status: 500,
                    title: None,
                    detail: None,
                }),
            );
        let run = run_workflow(
            TaskList::new().with("split", TaskDefinition::fork(branches, false)),
            json!({}),
        )
        .await;

        assert_eq!(run.instance.status.phase, WorkflowInstanceStatusPhase::Faulted);
        assert_eq!(task_by_name(&run.instance, "slow").status, TaskInstanceStatus::Cancelled);
        assert_eq!(task_by_name(&run.instance, "split").status, TaskInstanceStatus::Faulted);
        assert_eq!(
            run.instance.status.error.unwrap().instance.as_deref(),
            Some("/do/0/split/fork/branches/1/broken")
        );
    }

    #[tokio::test]
    async fn test_compete_takes_first_completion() {
        let branches = TaskList::new()
            .with("tortoise", slow_set(3_600_000, json!("tortoise")))
            .with("hare", slow_set(1, json!("hare")));
        let run = run_workflow(
            TaskList::new().with("race", TaskDefinition::fork(branches, true)),
            json!({}),
        )
        .await;

        assert_eq!(run.output, Some(json!("hare")));
        assert_eq!(
            task_by_name(&run.instance, "tortoise").status,
            TaskInstanceStatus::Cancelled
        );
    }
}
