//! `listen`: wait for correlated events, either all at once or as a stream.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;
use weft_types::definition::{ListenTaskDefinition, SubscriptionIterator};

use crate::workflow::error::EngineError;
use crate::workflow::executor::{StepResult, TaskBehavior, TaskExecutor};
use crate::workflow::sequence::{SequenceOutcome, run_sequence};

pub struct ListenTaskBehavior {
    definition: ListenTaskDefinition,
}

impl ListenTaskBehavior {
    pub fn new(definition: ListenTaskDefinition) -> Self {
        Self { definition }
    }

    async fn consume(&self, executor: &Arc<TaskExecutor>) -> Result<StepResult, EngineError> {
        let result = executor
            .context()
            .correlate(&self.definition.listen, executor.scope().clone())
            .await;
        let correlation = match result {
            Ok(correlation) => correlation,
            Err(EngineError::Cancelled) => return Ok(StepResult::Cancel),
            Err(e) => return Err(e),
        };
        debug!(
            reference = %executor.reference(),
            correlation = %correlation.id,
            events = correlation.events.len(),
            "listener correlated"
        );
        let events = correlation
            .events
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StepResult::complete(Value::Array(events)))
    }

    async fn consume_stream(
        &self,
        executor: &Arc<TaskExecutor>,
        iterator: &SubscriptionIterator,
    ) -> Result<StepResult, EngineError> {
        let instance = executor.instance();
        let mut stream = executor.context().stream(
            &instance,
            &self.definition.listen,
            executor.scope().clone(),
        );
        let base_context = match executor.context().context_data() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };

        let mut outputs = Vec::new();
        while let Some(next) = stream.next().await {
            let streamed = match next {
                Ok(streamed) => streamed,
                Err(EngineError::Cancelled) => return Ok(StepResult::Cancel),
                Err(e) => return Err(e),
            };
            let item = serde_json::to_value(&streamed.event)?;
            let at = streamed.offset.saturating_sub(1);

            let output = match &iterator.do_ {
                Some(tasks) => {
                    let mut context = base_context.clone();
                    context.insert(iterator.item.clone(), item.clone());
                    context.insert(iterator.at.clone(), Value::from(at));
                    let path = format!("foreach/{at}/do");
                    match run_sequence(executor, tasks, &path, item, Some(Value::Object(context)))
                        .await?
                    {
                        SequenceOutcome::Completed { output, .. } => output,
                        other => {
                            return Ok(other.into_step_result(executor.instance().is_extension));
                        }
                    }
                }
                None => item,
            };
            streamed.ack().await?;
            outputs.push(output);
        }

        if executor.scope().is_cancelled() {
            return Ok(StepResult::Cancel);
        }
        Ok(StepResult::complete(Value::Array(outputs)))
    }
}

impl TaskBehavior for ListenTaskBehavior {
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        _input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        Box::pin(async move {
            match &self.definition.foreach {
                Some(iterator) => self.consume_stream(&executor, iterator).await,
                None => self.consume(&executor).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use weft_types::definition::{
        CorrelationKeyDefinition, EventConsumptionStrategy, EventFilter, ListenTaskDefinition,
        ListenerDefinition, SubscriptionIterator, TaskDefinition, TaskKind, TaskList,
    };
    use weft_types::event::CloudEvent;
    use weft_types::instance::WorkflowInstanceStatusPhase;

    use crate::event::CloudEventBus;
    use crate::workflow::functions::FunctionRegistry;
    use crate::workflow::context::WorkflowExecutionContext;
    use crate::workflow::runner::WorkflowOutcome;
    use crate::workflow::tasks::testing::{definition, start_definition, wait_for_phase};

    fn filter(type_: &str) -> EventFilter {
        EventFilter::default().with_attribute("type", type_)
    }

    fn listen(to: EventConsumptionStrategy, foreach: Option<SubscriptionIterator>) -> TaskDefinition {
        TaskDefinition::new(TaskKind::Listen(ListenTaskDefinition {
            listen: ListenerDefinition { to },
            foreach,
        }))
    }

    fn event(type_: &str, data: serde_json::Value) -> CloudEvent {
        CloudEvent::new("https://tests.example.com", type_).with_data(data)
    }

    #[tokio::test]
    async fn test_all_strategy_waits_for_every_filter() {
        let bus = CloudEventBus::new(16);
        let tasks = TaskList::new().with(
            "await",
            listen(
                EventConsumptionStrategy {
                    all: Some(vec![filter("com.example.paid"), filter("com.example.shipped")]),
                    ..Default::default()
                },
                None,
            ),
        );
        let (context, handle) =
            start_definition(definition(tasks), json!({}), FunctionRegistry::new(), bus.clone());
        wait_for_phase(context.as_ref(), WorkflowInstanceStatusPhase::Waiting).await;

        bus.publish(event("com.example.unrelated", json!({})));
        bus.publish(event("com.example.shipped", json!({"n": "1"})));
        bus.publish(event("com.example.paid", json!({"n": "2"})));

        let outcome = handle.await.unwrap();
        let WorkflowOutcome::Completed(output) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        let types: Vec<_> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["com.example.shipped", "com.example.paid"]);
    }

    #[tokio::test]
    async fn test_correlation_keys_must_agree() {
        let bus = CloudEventBus::new(16);
        let mut keyed = filter("com.example.reading");
        keyed.correlate = BTreeMap::from([(
            "device".to_string(),
            CorrelationKeyDefinition {
                from: "data.device".into(),
                expect: Some("sensor-1".into()),
            },
        )]);
        let tasks = TaskList::new().with(
            "await",
            listen(
                EventConsumptionStrategy {
                    one: Some(keyed),
                    ..Default::default()
                },
                None,
            ),
        );
        let (context, handle) =
            start_definition(definition(tasks), json!({}), FunctionRegistry::new(), bus.clone());
        wait_for_phase(context.as_ref(), WorkflowInstanceStatusPhase::Waiting).await;

        bus.publish(event("com.example.reading", json!({"device": "sensor-2"})));
        bus.publish(event("com.example.reading", json!({"device": "sensor-1", "value": "hot"})));

        let WorkflowOutcome::Completed(output) = handle.await.unwrap() else {
            panic!("workflow did not complete");
        };
        assert_eq!(output[0]["data"]["value"], "hot");
        let instance = context.state().snapshot().await;
        let correlation = instance.status.correlation.contexts.values().next().unwrap();
        assert_eq!(correlation.keys.get("device").map(String::as_str), Some("sensor-1"));
    }

    #[tokio::test]
    async fn test_stream_runs_body_per_event_until_done() {
        let bus = CloudEventBus::new(16);
        let iterator = SubscriptionIterator {
            item: "reading".into(),
            at: "position".into(),
            do_: Some(TaskList::new().with(
                "record",
                TaskDefinition::set(json!({"value": "${ context.reading.data.value }"})),
            )),
        };
        let tasks = TaskList::new().with(
            "collect",
            listen(
                EventConsumptionStrategy {
                    any: Some(vec![filter("com.example.reading")]),
                    until: Some(Box::new(EventConsumptionStrategy {
                        one: Some(filter("com.example.done")),
                        ..Default::default()
                    })),
                    ..Default::default()
                },
                Some(iterator),
            ),
        );
        let (context, handle) =
            start_definition(definition(tasks), json!({}), FunctionRegistry::new(), bus.clone());
        wait_for_phase(context.as_ref(), WorkflowInstanceStatusPhase::Waiting).await;

        bus.publish(event("com.example.reading", json!({"value": "a"})));
        bus.publish(event("com.example.reading", json!({"value": "b"})));
        bus.publish(event("com.example.done", json!({})));

        let WorkflowOutcome::Completed(output) = handle.await.unwrap() else {
            panic!("workflow did not complete");
        };
        assert_eq!(output, json!([{"value": "a"}, {"value": "b"}]));

        let instance = context.state().snapshot().await;
        let references: Vec<_> = instance
            .status
            .tasks
            .iter()
            .filter(|t| t.name == "record")
            .map(|t| t.reference.clone())
            .collect();
        assert_eq!(
            references,
            vec![
                "/do/0/collect/foreach/0/do/0/record",
                "/do/0/collect/foreach/1/do/0/record"
            ]
        );
    }
}
