//! `raise`: fault with a declared error.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::definition::RaiseTaskDefinition;
use weft_types::error::ErrorDetails;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_string;

pub struct RaiseTaskBehavior {
    definition: RaiseTaskDefinition,
}

impl RaiseTaskBehavior {
    pub fn new(definition: RaiseTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for RaiseTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let declared = &self.definition.raise.error;
            let arguments = executor.context().arguments();
            let evaluator = executor.evaluator();

            let title = match &declared.title {
                Some(title) => Some(evaluate_string(evaluator, title, &input, &arguments)?),
                None => None,
            };
            let detail = match &declared.detail {
                Some(detail) => Some(evaluate_string(evaluator, detail, &input, &arguments)?),
                None => None,
            };
            Ok(StepResult::Fault(ErrorDetails {
                type_: evaluate_string(evaluator, &declared.type_, &input, &arguments)?,
                status: declared.status,
                title,
                detail,
                instance: Some(executor.reference()),
            }))
        })
    }
}
