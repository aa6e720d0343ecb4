//! In-process execution context.
//!
//! The instance lives only in memory; `listen` tasks correlate against a
//! local [`CloudEventBus`]. Suited to tests, the CLI and embedding.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::try_stream;
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::correlation::CorrelationContext;
use weft_types::definition::{
    EventConsumptionStrategy, EventFilter, ListenerDefinition, WorkflowDefinition,
};
use weft_types::event::CloudEvent;
use weft_types::instance::{
    TaskInstance, WorkflowDefinitionReference, WorkflowInstance, WorkflowInstanceSpec,
    WorkflowInstanceStatusPhase,
};
use weft_types::resource::ResourceMetadata;

use crate::event::CloudEventBus;
use crate::repository::memory::MemoryDocumentRepository;
use crate::repository::{CloudEventPublisherDyn, DocumentRepositoryDyn};

use super::context::{OffsetAcknowledger, StreamedEvent, WorkflowExecutionContext};
use super::error::EngineError;
use super::expression::{ExpressionEvaluator, JexlEvaluator, evaluate_expression};
use super::state::{ExecutionState, InstancePersistence};

/// Accepts every snapshot as-is.
struct InMemoryPersistence;

impl InstancePersistence for InMemoryPersistence {
    fn persist<'a>(
        &'a self,
        _previous: &'a WorkflowInstance,
        next: &'a WorkflowInstance,
    ) -> BoxFuture<'a, Result<WorkflowInstance, EngineError>> {
        Box::pin(async move { Ok(next.clone()) })
    }
}

/// Builder for [`StandaloneWorkflowContext`].
pub struct StandaloneWorkflowContextBuilder {
    definition: WorkflowDefinition,
    input: Value,
    config: EngineConfig,
    bus: Option<CloudEventBus>,
    documents: Option<Arc<dyn DocumentRepositoryDyn>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    sink: Option<Arc<dyn CloudEventPublisherDyn>>,
}

impl StandaloneWorkflowContextBuilder {
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: CloudEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentRepositoryDyn>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Receives lifecycle events (when enabled) and every emitted event.
    pub fn sink(mut self, sink: Arc<dyn CloudEventPublisherDyn>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Arc<StandaloneWorkflowContext> {
        let document = &self.definition.document;
        let namespace = if document.namespace.is_empty() {
            self.config.default_namespace.clone()
        } else {
            document.namespace.clone()
        };
        let suffix = Uuid::now_v7().simple().to_string();
        let name = format!("{}-{}", document.name, &suffix[suffix.len() - 8..]);
        let instance = WorkflowInstance::new(
            ResourceMetadata::new(namespace, name),
            WorkflowInstanceSpec {
                definition: WorkflowDefinitionReference {
                    namespace: document.namespace.clone(),
                    name: document.name.clone(),
                    version: document.version.clone(),
                },
                input: Some(self.input),
            },
        );

        let bus = self
            .bus
            .unwrap_or_else(|| CloudEventBus::new(self.config.event_bus_capacity.max(1)));
        let mut state = ExecutionState::new(
            Arc::new(self.definition),
            instance,
            self.config,
            self.evaluator.unwrap_or_else(|| Arc::new(JexlEvaluator::new())),
            self.documents
                .unwrap_or_else(|| Arc::new(MemoryDocumentRepository::new())),
            Box::new(InMemoryPersistence),
        );
        if let Some(sink) = &self.sink {
            state = state.with_lifecycle_publisher(Arc::clone(sink));
        }

        Arc::new(StandaloneWorkflowContext {
            state,
            bus,
            sink: self.sink,
            offsets: Arc::new(DashMap::new()),
        })
    }
}

/// Execution context for a workflow instance that is never persisted.
pub struct StandaloneWorkflowContext {
    state: ExecutionState,
    bus: CloudEventBus,
    sink: Option<Arc<dyn CloudEventPublisherDyn>>,
    /// Acknowledged stream offsets by task reference.
    offsets: Arc<DashMap<String, u64>>,
}

impl StandaloneWorkflowContext {
    pub fn builder(definition: WorkflowDefinition) -> StandaloneWorkflowContextBuilder {
        StandaloneWorkflowContextBuilder {
            definition,
            input: Value::Object(Map::new()),
            config: EngineConfig::default(),
            bus: None,
            documents: None,
            evaluator: None,
            sink: None,
        }
    }

    /// The bus `listen` tasks correlate against.
    pub fn bus(&self) -> &CloudEventBus {
        &self.bus
    }

    pub fn instance_name(&self) -> &str {
        self.state.qualified_name()
    }

    async fn correlate_local(
        &self,
        task: &TaskInstance,
        listener: &ListenerDefinition,
        cancellation: CancellationToken,
    ) -> Result<CorrelationContext, EngineError> {
        if let Some(context) = self.state.correlation_context(&task.reference).await {
            debug!(reference = %task.reference, "correlation already resolved");
            return Ok(context);
        }

        let mut events = self.bus.subscribe();
        self.state
            .set_phase(WorkflowInstanceStatusPhase::Waiting)
            .await?;
        let mut matcher = CorrelationMatcher::new(&listener.to);

        loop {
            let event = tokio::select! {
                _ = cancellation.cancelled() => {
                    self.state.set_phase(WorkflowInstanceStatusPhase::Running).await?;
                    return Err(EngineError::Cancelled);
                }
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(reference = %task.reference, skipped, "listener lagged behind the event bus");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(EngineError::Correlation("event bus closed".to_string()));
                    }
                },
            };
            if matcher.offer(self.state.evaluator(), &event) && matcher.is_complete() {
                break;
            }
        }

        let context = matcher.into_context(Uuid::now_v7().to_string());
        debug!(
            reference = %task.reference,
            events = context.events.len(),
            "correlation resolved"
        );
        self.state
            .record_correlation(&task.reference, context.clone())
            .await?;
        Ok(context)
    }

    fn stream_local<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> impl Stream<Item = Result<StreamedEvent, EngineError>> + Send + 'a {
        try_stream! {
            let mut events = self.bus.subscribe();
            self.state.set_phase(WorkflowInstanceStatusPhase::Waiting).await?;
            let acknowledger: Arc<dyn OffsetAcknowledger> = Arc::new(LocalAcknowledger {
                offsets: Arc::clone(&self.offsets),
                reference: task.reference.clone(),
            });
            let mut offset = self.offsets.get(&task.reference).map(|o| *o).unwrap_or(0);
            let until = listener.to.until.as_deref();

            loop {
                let event = tokio::select! {
                    _ = cancellation.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(reference = %task.reference, skipped, "stream lagged behind the event bus");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if until.is_some_and(|until| until.matches_any(&event)) {
                    debug!(reference = %task.reference, "stream completed");
                    break;
                }
                if !listener.to.matches_any(&event) {
                    continue;
                }
                offset += 1;
                yield StreamedEvent::new(event, offset, Arc::clone(&acknowledger));
            }

            self.state.set_phase(WorkflowInstanceStatusPhase::Running).await?;
        }
    }
}

impl WorkflowExecutionContext for StandaloneWorkflowContext {
    fn state(&self) -> &ExecutionState {
        &self.state
    }

    fn correlate<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, Result<CorrelationContext, EngineError>> {
        Box::pin(self.correlate_local(task, listener, cancellation))
    }

    fn stream<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxStream<'a, Result<StreamedEvent, EngineError>> {
        Box::pin(self.stream_local(task, listener, cancellation))
    }

    fn publish(&self, event: CloudEvent) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.publish_boxed(&event).await {
                    warn!(event_type = %event.type_, error = %e, "failed to forward emitted event");
                }
            }
            self.bus.publish(event);
            Ok(())
        })
    }
}

struct LocalAcknowledger {
    offsets: Arc<DashMap<String, u64>>,
    reference: String,
}

impl OffsetAcknowledger for LocalAcknowledger {
    fn acknowledge(&self, offset: u64) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let mut acked = self.offsets.entry(self.reference.clone()).or_insert(0);
            *acked = (*acked).max(offset);
            Ok(())
        })
    }
}

/// Accumulates bus events against a consumption strategy.
struct CorrelationMatcher<'a> {
    /// `(filter, satisfied)`; `all` needs every slot, otherwise one suffices.
    slots: Vec<(&'a EventFilter, bool)>,
    require_all: bool,
    keys: BTreeMap<String, String>,
    events: Vec<CloudEvent>,
}

impl<'a> CorrelationMatcher<'a> {
    fn new(strategy: &'a EventConsumptionStrategy) -> Self {
        let require_all = strategy.all.is_some();
        let slots = strategy.filters().into_iter().map(|f| (f, false)).collect();
        Self {
            slots,
            require_all,
            keys: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Offer an event to the first open slot it satisfies.
    ///
    /// Key expressions see the event payload as `data` and the whole event
    /// as `event`.
    fn offer(&mut self, evaluator: &dyn ExpressionEvaluator, event: &CloudEvent) -> bool {
        let Ok(envelope) = serde_json::to_value(event) else {
            return false;
        };
        let data = event.data.clone().unwrap_or(Value::Null);
        let mut arguments = Map::new();
        arguments.insert("event".to_string(), envelope);
        for index in 0..self.slots.len() {
            let (filter, satisfied) = self.slots[index];
            if satisfied || !filter.matches(event) {
                continue;
            }
            let Some(keys) = self.extract_keys(evaluator, filter, &data, &arguments) else {
                continue;
            };
            self.keys.extend(keys);
            self.slots[index].1 = true;
            self.events.push(event.clone());
            return true;
        }
        false
    }

    /// Correlation keys of `event`, or `None` when they conflict with the
    /// keys collected so far or with an expected value.
    fn extract_keys(
        &self,
        evaluator: &dyn ExpressionEvaluator,
        filter: &EventFilter,
        data: &Value,
        arguments: &Map<String, Value>,
    ) -> Option<BTreeMap<String, String>> {
        let mut extracted = BTreeMap::new();
        for (name, key) in &filter.correlate {
            let value = match evaluate_expression(evaluator, &key.from, data, arguments) {
                Ok(Value::String(s)) => s,
                Ok(Value::Null) => return None,
                Ok(other) => other.to_string(),
                Err(e) => {
                    debug!(key = %name, error = %e, "correlation key not extractable");
                    return None;
                }
            };
            if key.expect.as_ref().is_some_and(|expected| *expected != value) {
                return None;
            }
            if self.keys.get(name).is_some_and(|known| *known != value) {
                return None;
            }
            extracted.insert(name.clone(), value);
        }
        Some(extracted)
    }

    fn is_complete(&self) -> bool {
        if self.require_all {
            self.slots.iter().all(|(_, satisfied)| *satisfied)
        } else {
            self.slots.iter().any(|(_, satisfied)| *satisfied)
        }
    }

    fn into_context(self, id: String) -> CorrelationContext {
        let offset = self.events.len() as u64;
        CorrelationContext {
            id,
            keys: self.keys,
            events: self.events,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::definition::{CorrelationKeyDefinition, TaskDefinition, TaskList};

    use crate::repository::memory::MemoryCloudEventPublisher;

    fn reading(device: &str) -> CloudEvent {
        CloudEvent::new("https://tests.example.com", "com.example.reading")
            .with_data(json!({"device": device}))
    }

    #[test]
    fn test_matcher_all_requires_every_filter() {
        let strategy = EventConsumptionStrategy {
            all: Some(vec![
                EventFilter::default().with_attribute("type", "a"),
                EventFilter::default().with_attribute("type", "b"),
            ]),
            ..Default::default()
        };
        let evaluator = JexlEvaluator::new();
        let mut matcher = CorrelationMatcher::new(&strategy);

        assert!(matcher.offer(&evaluator, &CloudEvent::new("s", "a")));
        assert!(!matcher.is_complete());
        assert!(!matcher.offer(&evaluator, &CloudEvent::new("s", "a")));
        assert!(matcher.offer(&evaluator, &CloudEvent::new("s", "b")));
        assert!(matcher.is_complete());
        assert_eq!(matcher.into_context("c".into()).offset, 2);
    }

    #[test]
    fn test_matcher_rejects_conflicting_keys() {
        let mut keyed = EventFilter::default().with_attribute("type", "com.example.reading");
        keyed.correlate.insert(
            "device".into(),
            CorrelationKeyDefinition {
                from: "${ data.device }".into(),
                expect: None,
            },
        );
        let strategy = EventConsumptionStrategy {
            all: Some(vec![keyed.clone(), keyed]),
            ..Default::default()
        };
        let evaluator = JexlEvaluator::new();
        let mut matcher = CorrelationMatcher::new(&strategy);

        assert!(matcher.offer(&evaluator, &reading("d1")));
        assert!(!matcher.offer(&evaluator, &reading("d2")));
        assert!(matcher.offer(&evaluator, &reading("d1")));
        let context = matcher.into_context("c".into());
        assert_eq!(context.keys.get("device").map(String::as_str), Some("d1"));
    }

    #[tokio::test]
    async fn test_emitted_events_reach_bus_and_sink() {
        let sink = Arc::new(MemoryCloudEventPublisher::new());
        let context = StandaloneWorkflowContext::builder(WorkflowDefinition::new(
            "default",
            "emitter",
            "1.0.0",
            TaskList::new().with("noop", TaskDefinition::set(json!({}))),
        ))
        .sink(sink.clone())
        .build();
        let mut received = context.bus().subscribe();

        context
            .publish(CloudEvent::new("https://tests.example.com", "com.example.ping"))
            .await
            .unwrap();

        assert_eq!(received.try_recv().unwrap().type_, "com.example.ping");
        assert_eq!(sink.event_types(), vec!["com.example.ping"]);
        assert!(context.instance_name().starts_with("emitter-"));
    }
}
