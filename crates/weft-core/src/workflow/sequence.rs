//! Runs a task list one child at a time, following flow directives.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use weft_types::definition::{FlowDirective, TaskList};
use weft_types::error::ErrorDetails;

use super::error::EngineError;
use super::executor::{ChildSpec, StepResult, TaskExecutor, TaskOutcome};

/// How a task list ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// `directive` is `Continue` when the list ran to its end, otherwise the
    /// `End` or `Exit` that stopped it.
    Completed {
        output: Value,
        directive: FlowDirective,
    },
    Faulted(ErrorDetails),
    Cancelled,
    Suspended,
}

impl SequenceOutcome {
    /// Map onto the owning task's step result.
    ///
    /// `end` propagates to the enclosing list. `exit` stops only this list,
    /// except inside an extension hook where it tells the hooked task to
    /// skip the rest of its hooks.
    pub fn into_step_result(self, is_extension: bool) -> StepResult {
        match self {
            SequenceOutcome::Completed { output, directive } => {
                let then = match directive {
                    FlowDirective::End => Some(FlowDirective::End),
                    FlowDirective::Exit if is_extension => Some(FlowDirective::Exit),
                    _ => None,
                };
                StepResult::Complete { output, then }
            }
            SequenceOutcome::Faulted(error) => StepResult::Fault(error),
            SequenceOutcome::Cancelled => StepResult::Cancel,
            SequenceOutcome::Suspended => StepResult::Suspend,
        }
    }
}

/// Execute `tasks` under `parent`, feeding each child's output to the next.
///
/// A child fault stops the list immediately. Children are addressed as
/// `{path}/{index}/{name}`; re-running the list after a resume reuses the
/// instances created by the previous run.
pub async fn run_sequence(
    parent: &Arc<TaskExecutor>,
    tasks: &TaskList,
    path: &str,
    input: Value,
    context: Option<Value>,
) -> Result<SequenceOutcome, EngineError> {
    let mut visits: HashMap<String, usize> = HashMap::new();
    let mut index = 0;
    let mut current = input;

    while let Some((name, definition)) = tasks.get(index) {
        let occurrence = visits.entry(name.to_string()).or_insert(0);
        let spec = ChildSpec {
            name: name.to_string(),
            definition: definition.clone(),
            path: format!("{path}/{index}/{name}"),
            input: current.clone(),
            context: context.clone(),
            is_extension: false,
        };
        let child = parent.create_child(spec, *occurrence).await?;
        *occurrence += 1;

        match child.execute().await? {
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
                    directive @ (FlowDirective::End | FlowDirective::Exit) => {
                        return Ok(SequenceOutcome::Completed {
                            output: current,
                            directive,
                        });
                    }
                }
            }
            TaskOutcome::Skipped { output } => {
                current = output;
                index += 1;
            }
            TaskOutcome::Faulted(error) => return Ok(SequenceOutcome::Faulted(error)),
            TaskOutcome::Cancelled => return Ok(SequenceOutcome::Cancelled),
            TaskOutcome::Suspended => return Ok(SequenceOutcome::Suspended),
        }
    }

    Ok(SequenceOutcome::Completed {
        output: current,
        directive: FlowDirective::Continue,
    })
}
