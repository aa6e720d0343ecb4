//! Workflow definition parsing, validation, and file loading.
//!
//! Converts YAML/JSON into `WorkflowDefinition` and validates the structural
//! constraints the runtime relies on (unique task names per list, resolvable
//! `then` targets, well-formed loops and switches).

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use weft_types::definition::{FlowDirective, TaskKind, TaskList, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A flow directive names a task that does not exist in its list.
    #[error("unknown task '{target}' referenced from '{from}'")]
    UnknownTask { from: String, target: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// JSON is valid YAML, so this accepts both.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

/// Load a workflow definition from a YAML or JSON file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Document name and namespace are non-empty
/// - The top-level `do` list has at least one task
/// - Task names are unique within each list
/// - Named `then` targets exist in the same list
/// - `for.in` is non-empty; `switch` has at least one case
/// - Extension hook lists are themselves valid
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.document.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.document.namespace.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow namespace must not be empty".to_string(),
        ));
    }
    if def.do_.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow must declare at least one task".to_string(),
        ));
    }

    validate_task_list(&def.do_, "do")?;

    for (name, extension) in def.extensions() {
        if extension.extend.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "extension '{name}' must declare the task kind it extends"
            )));
        }
        if let Some(before) = &extension.before {
            validate_task_list(before, &format!("use/extensions/{name}/before"))?;
        }
        if let Some(after) = &extension.after {
            validate_task_list(after, &format!("use/extensions/{name}/after"))?;
        }
    }

    Ok(())
}

fn validate_task_list(tasks: &TaskList, path: &str) -> Result<(), DefinitionError> {
    let mut seen = HashSet::new();
    for (name, _) in tasks.iter() {
        if name.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "task at '{path}' has an empty name"
            )));
        }
        if !seen.insert(name) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate task name '{name}' in '{path}'"
            )));
        }
    }

    for (index, (name, task)) in tasks.iter().enumerate() {
        let task_path = format!("{path}/{index}/{name}");

        if let Some(FlowDirective::Goto(target)) = &task.then {
            if !seen.contains(target.as_str()) {
                return Err(DefinitionError::UnknownTask {
                    from: task_path,
                    target: target.clone(),
                });
            }
        }

        match &task.kind {
            TaskKind::Do(t) => validate_task_list(&t.do_, &format!("{task_path}/do"))?,
            TaskKind::Fork(t) => {
                validate_task_list(&t.fork.branches, &format!("{task_path}/fork/branches"))?
            }
            TaskKind::For(t) => {
                if t.for_.in_.trim().is_empty() {
                    return Err(DefinitionError::ValidationError(format!(
                        "'{task_path}': for.in must not be empty"
                    )));
                }
                if t.for_.limit == Some(0) {
                    return Err(DefinitionError::ValidationError(format!(
                        "'{task_path}': for.limit must be >= 1"
                    )));
                }
                validate_task_list(&t.do_, &format!("{task_path}/do"))?;
            }
            TaskKind::Try(t) => {
                validate_task_list(&t.try_, &format!("{task_path}/try"))?;
                if let Some(catch_do) = &t.catch.do_ {
                    validate_task_list(catch_do, &format!("{task_path}/catch/do"))?;
                }
            }
            TaskKind::Switch(t) => {
                if t.switch.is_empty() {
                    return Err(DefinitionError::ValidationError(format!(
                        "'{task_path}': switch must declare at least one case"
                    )));
                }
                for (case_name, case) in t.switch.iter() {
                    if let FlowDirective::Goto(target) = &case.then {
                        if !seen.contains(target.as_str()) {
                            return Err(DefinitionError::UnknownTask {
                                from: format!("{task_path}/switch/{case_name}"),
                                target: target.clone(),
                            });
                        }
                    }
                }
            }
            TaskKind::Listen(t) => {
                if t.listen.to.filters().is_empty() {
                    return Err(DefinitionError::ValidationError(format!(
                        "'{task_path}': listen.to must declare all, any or one"
                    )));
                }
                if let Some(body) = t.foreach.as_ref().and_then(|f| f.do_.as_ref()) {
                    validate_task_list(body, &format!("{task_path}/foreach/do"))?;
                }
            }
            TaskKind::Call(t) => {
                if t.call.trim().is_empty() {
                    return Err(DefinitionError::ValidationError(format!(
                        "'{task_path}': call must name a function"
                    )));
                }
            }
            TaskKind::Raise(_) | TaskKind::Set(_) | TaskKind::Wait(_) | TaskKind::Emit(_) => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
