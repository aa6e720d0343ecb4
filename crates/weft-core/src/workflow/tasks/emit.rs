//! `emit`: publish a CloudEvent built from the task's attributes.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use weft_types::definition::EmitTaskDefinition;
use weft_types::error::ErrorDetails;
use weft_types::event::CloudEvent;

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::expression::evaluate_template;

pub struct EmitTaskBehavior {
    definition: EmitTaskDefinition,
}

impl EmitTaskBehavior {
    pub fn new(definition: EmitTaskDefinition) -> Self {
        Self { definition }
    }
}

impl TaskBehavior for EmitTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let arguments = executor.context().arguments();
            let template = Value::Object(
                self.definition
                    .emit
                    .event
                    .with
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            );
            let attributes: BTreeMap<String, Value> =
                match evaluate_template(executor.evaluator(), &template, &input, &arguments)? {
                    Value::Object(fields) => fields.into_iter().collect(),
                    _ => BTreeMap::new(),
                };

            let event = match CloudEvent::from_attributes(attributes) {
                Ok(event) => event,
                Err(reason) => {
                    return Ok(StepResult::Fault(
                        ErrorDetails::validation(reason).with_instance(executor.reference()),
                    ));
                }
            };
            debug!(event_type = %event.type_, id = %event.id, "emitting event");
            executor.context().workflow().publish(event).await?;
            Ok(StepResult::complete(input))
        })
    }
}
