//! Execution context backed by remote resource and document stores.
//!
//! Every transition is persisted as an RFC 6902 patch of the instance
//! status. Correlation is delegated to an external correlator: the context
//! creates a `Correlation` resource per `listen` task and watches the
//! workflow instance (and, for streams, the correlation) for results.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_types::config::EngineConfig;
use weft_types::correlation::{
    Correlation, CorrelationContext, CorrelationLifetime, CorrelationOutcome, CorrelationSpec,
    CorrelationStatus,
};
use weft_types::definition::{ListenerDefinition, WorkflowDefinition};
use weft_types::error::{ErrorDetails, RepositoryError};
use weft_types::event::CloudEvent;
use weft_types::instance::{TaskInstance, WorkflowInstance, WorkflowInstanceStatusPhase};
use weft_types::resource::{ResourceMetadata, ResourceReference};
use weft_types::workflow::{Workflow, WorkflowStatus};

use crate::repository::{
    CloudEventPublisherDyn, DocumentRepositoryDyn, ResourceRepositoryDyn, update_status_with_retry,
};

use super::context::{OffsetAcknowledger, StreamedEvent, WorkflowExecutionContext};
use super::error::EngineError;
use super::expression::ExpressionEvaluator;
use super::state::{ExecutionState, InstancePersistence};

/// Pause before re-subscribing to a watch that ended.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(10);

/// Remote services used by [`ConnectedWorkflowContext`].
#[derive(Clone)]
pub struct ConnectedServices {
    pub documents: Arc<dyn DocumentRepositoryDyn>,
    pub instances: Arc<dyn ResourceRepositoryDyn<WorkflowInstance>>,
    pub workflows: Arc<dyn ResourceRepositoryDyn<Workflow>>,
    pub correlations: Arc<dyn ResourceRepositoryDyn<Correlation>>,
    pub publisher: Arc<dyn CloudEventPublisherDyn>,
}

/// Writes each transition as a status patch.
///
/// Conflicts with concurrent writers are resolved by re-applying the same
/// delta against the latest stored version.
struct RemotePersistence {
    instances: Arc<dyn ResourceRepositoryDyn<WorkflowInstance>>,
}

impl InstancePersistence for RemotePersistence {
    fn persist<'a>(
        &'a self,
        previous: &'a WorkflowInstance,
        next: &'a WorkflowInstance,
    ) -> BoxFuture<'a, Result<WorkflowInstance, EngineError>> {
        Box::pin(async move {
            let before = serde_json::to_value(&previous.status)?;
            let after = serde_json::to_value(&next.status)?;
            let patch = json_patch::diff(&before, &after);
            if patch.0.is_empty() {
                return Ok(next.clone());
            }

            let namespace = &next.metadata.namespace;
            let name = &next.metadata.name;
            let mut expected = previous.metadata.resource_version;
            loop {
                match self
                    .instances
                    .patch_status_boxed(namespace, name, &patch, Some(expected))
                    .await
                {
                    Ok(stored) => return Ok(stored),
                    Err(e) if e.is_conflict() => {
                        let current = self
                            .instances
                            .get_boxed(namespace, name)
                            .await?
                            .ok_or(RepositoryError::NotFound)?;
                        debug!(
                            instance = %next.metadata.qualified_name(),
                            expected,
                            actual = current.metadata.resource_version,
                            "instance patch conflicted, rebasing"
                        );
                        expected = current.metadata.resource_version;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }
}

/// Execution context for an instance stored remotely.
pub struct ConnectedWorkflowContext {
    state: ExecutionState,
    services: ConnectedServices,
    namespace: String,
    name: String,
    /// Names of ephemeral correlations created by this context.
    correlations: Mutex<HashSet<String>>,
}

impl ConnectedWorkflowContext {
    /// Wrap an instance that already exists in `services.instances`.
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        instance: WorkflowInstance,
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
        services: ConnectedServices,
    ) -> Arc<Self> {
        let namespace = instance.metadata.namespace.clone();
        let name = instance.metadata.name.clone();
        let state = ExecutionState::new(
            definition,
            instance,
            config,
            evaluator,
            Arc::clone(&services.documents),
            Box::new(RemotePersistence {
                instances: Arc::clone(&services.instances),
            }),
        )
        .with_lifecycle_publisher(Arc::clone(&services.publisher));
        Arc::new(Self {
            state,
            services,
            namespace,
            name,
            correlations: Mutex::new(HashSet::new()),
        })
    }

    /// Load the instance `namespace/name` and wrap it.
    pub async fn load(
        namespace: &str,
        name: &str,
        definition: Arc<WorkflowDefinition>,
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
        services: ConnectedServices,
    ) -> Result<Arc<Self>, EngineError> {
        let instance = services
            .instances
            .get_boxed(namespace, name)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        Ok(Self::new(definition, instance, config, evaluator, services))
    }

    // -----------------------------------------------------------------------
    // Workflow statistics and teardown
    // -----------------------------------------------------------------------

    async fn update_statistics(&self, update: impl FnMut(&mut WorkflowStatus) + Send) {
        let document = &self.state.definition().document;
        match update_status_with_retry(
            self.services.workflows.as_ref(),
            &document.namespace,
            &document.name,
            update,
        )
        .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(
                workflow = %self.state.definition().qualified_name(),
                "no workflow resource, statistics not recorded"
            ),
            Err(e) => warn!(
                workflow = %self.state.definition().qualified_name(),
                error = %e,
                "failed to update workflow statistics"
            ),
        }
    }

    async fn record_started(&self) {
        let version = self.state.definition().document.version.clone();
        let now = Utc::now();
        self.update_statistics(move |status| {
            let stats = status.versions.entry(version.clone()).or_default();
            stats.total_instances += 1;
            stats.last_started_at = Some(now);
        })
        .await;
    }

    async fn record_ended(&self) {
        let version = self.state.definition().document.version.clone();
        let now = Utc::now();
        self.update_statistics(move |status| {
            status.versions.entry(version.clone()).or_default().last_ended_at = Some(now);
        })
        .await;
        self.delete_correlations().await;
    }

    async fn delete_correlations(&self) {
        let mut owned: HashSet<String> = self
            .correlations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        // Correlations created before a restart are only known from the status.
        let status = self.state.snapshot().await.status;
        owned.extend(
            status
                .tasks
                .iter()
                .filter(|task| status.correlation.contexts.contains_key(&task.reference))
                .map(|task| Correlation::name_for(&self.name, &task.id)),
        );
        for name in owned {
            match self
                .services
                .correlations
                .delete_boxed(&self.namespace, &name)
                .await
            {
                Ok(()) | Err(RepositoryError::NotFound) => {
                    debug!(correlation = %name, "ephemeral correlation deleted");
                }
                Err(e) => warn!(correlation = %name, error = %e, "failed to delete correlation"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Correlation
    // -----------------------------------------------------------------------

    /// Create the task's correlation unless it already exists.
    async fn ensure_correlation(
        &self,
        task: &TaskInstance,
        listener: &ListenerDefinition,
        stream: bool,
    ) -> Result<String, EngineError> {
        let name = Correlation::name_for(&self.name, &task.id);
        let instance = ResourceReference::new(self.namespace.clone(), self.name.clone());
        let correlation = Correlation {
            metadata: ResourceMetadata::new(self.namespace.clone(), name.clone()),
            spec: CorrelationSpec {
                source: instance.clone(),
                lifetime: CorrelationLifetime::Ephemeral,
                events: listener.to.clone(),
                stream,
                outcome: CorrelationOutcome {
                    instance,
                    task: task.reference.clone(),
                },
            },
            status: CorrelationStatus::default(),
        };
        match self.services.correlations.create_boxed(&correlation).await {
            Ok(_) => debug!(correlation = %name, reference = %task.reference, "correlation created"),
            Err(RepositoryError::AlreadyExists(_)) => {
                debug!(correlation = %name, "correlation already exists")
            }
            Err(e) => return Err(e.into()),
        }
        self.correlations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.clone());
        Ok(name)
    }

    /// The context recorded on the stored instance for `reference`, if any.
    async fn remote_context(&self, reference: &str) -> Result<Option<CorrelationContext>, EngineError> {
        let instance = self
            .services
            .instances
            .get_boxed(&self.namespace, &self.name)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        Ok(instance.status.correlation.contexts.get(reference).cloned())
    }

    async fn correlate_remote(
        &self,
        task: &TaskInstance,
        listener: &ListenerDefinition,
        cancellation: CancellationToken,
    ) -> Result<CorrelationContext, EngineError> {
        if let Some(context) = self.state.correlation_context(&task.reference).await {
            debug!(reference = %task.reference, "correlation already resolved");
            return Ok(context);
        }
        self.ensure_correlation(task, listener, false).await?;
        self.state
            .set_phase(WorkflowInstanceStatusPhase::Waiting)
            .await?;

        let resolved = loop {
            let mut changes = self
                .services
                .instances
                .monitor_boxed(&self.namespace, &self.name);
            // Changes made before the subscription are not replayed.
            if let Some(context) = self.remote_context(&task.reference).await? {
                break context;
            }

            let observed = loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        self.state.set_phase(WorkflowInstanceStatusPhase::Running).await?;
                        return Err(EngineError::Cancelled);
                    }
                    change = changes.next() => match change {
                        Some(Ok(event)) => {
                            let contexts = &event.resource.status.correlation.contexts;
                            if let Some(context) = contexts.get(&task.reference) {
                                break Some(context.clone());
                            }
                        }
                        Some(Err(e)) => {
                            warn!(reference = %task.reference, error = %e, "instance watch failed");
                            break None;
                        }
                        None => break None,
                    },
                }
            };
            if let Some(context) = observed {
                break context;
            }
            debug!(reference = %task.reference, "instance watch ended, resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        };

        self.state
            .record_correlation(&task.reference, resolved.clone())
            .await?;
        Ok(resolved)
    }

    /// Events stored on the correlation and its acknowledged offset.
    async fn correlated_events(&self, correlation: &str) -> Result<(Vec<CloudEvent>, u64), EngineError> {
        let stored = self
            .services
            .correlations
            .get_boxed(&self.namespace, correlation)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        Ok(stored
            .status
            .contexts
            .into_iter()
            .next()
            .map(|context| (context.events, context.offset))
            .unwrap_or_default())
    }

    fn stream_remote<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> impl Stream<Item = Result<StreamedEvent, EngineError>> + Send + 'a {
        try_stream! {
            let correlation = self.ensure_correlation(task, listener, true).await?;
            self.state.set_phase(WorkflowInstanceStatusPhase::Waiting).await?;
            let acknowledger: Arc<dyn OffsetAcknowledger> = Arc::new(CorrelationAcknowledger {
                correlations: Arc::clone(&self.services.correlations),
                namespace: self.namespace.clone(),
                name: correlation.clone(),
            });
            let mut delivered: u64 = 0;

            let completion = 'watch: loop {
                let mut correlation_changes = self
                    .services
                    .correlations
                    .monitor_boxed(&self.namespace, &correlation);
                let mut instance_changes = self
                    .services
                    .instances
                    .monitor_boxed(&self.namespace, &self.name);

                loop {
                    // Completion is read before the events so that every event
                    // appended ahead of it is drained first.
                    let completion = self.remote_context(&task.reference).await?;
                    let (events, acknowledged) = self.correlated_events(&correlation).await?;
                    delivered = delivered.max(acknowledged);
                    let pending: Vec<CloudEvent> =
                        events.into_iter().skip(delivered as usize).collect();
                    for event in pending {
                        delivered += 1;
                        yield StreamedEvent::new(event, delivered, Arc::clone(&acknowledger));
                    }
                    if let Some(context) = completion {
                        break 'watch Some(context);
                    }

                    let change = tokio::select! {
                        _ = cancellation.cancelled() => StreamChange::Cancelled,
                        change = correlation_changes.next() => StreamChange::from_watch(change),
                        change = instance_changes.next() => StreamChange::from_watch(change),
                    };
                    match change {
                        StreamChange::Changed => {}
                        StreamChange::Disconnected => {
                            debug!(reference = %task.reference, "stream watch ended, resubscribing");
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            continue 'watch;
                        }
                        StreamChange::Cancelled => break 'watch None,
                    }
                }
            };

            match completion {
                Some(context) => {
                    debug!(reference = %task.reference, delivered, "stream completed");
                    self.state.record_correlation(&task.reference, context).await?;
                }
                None => {
                    self.state.set_phase(WorkflowInstanceStatusPhase::Running).await?;
                }
            }
        }
    }
}

enum StreamChange {
    Changed,
    Disconnected,
    Cancelled,
}

impl StreamChange {
    fn from_watch<T>(change: Option<Result<T, RepositoryError>>) -> Self {
        match change {
            Some(Ok(_)) => StreamChange::Changed,
            Some(Err(e)) => {
                warn!(error = %e, "correlation watch failed");
                StreamChange::Disconnected
            }
            None => StreamChange::Disconnected,
        }
    }
}

/// Persists acknowledged offsets on the correlation's first context.
struct CorrelationAcknowledger {
    correlations: Arc<dyn ResourceRepositoryDyn<Correlation>>,
    namespace: String,
    name: String,
}

impl OffsetAcknowledger for CorrelationAcknowledger {
    fn acknowledge(&self, offset: u64) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let name = self.name.clone();
            update_status_with_retry(
                self.correlations.as_ref(),
                &self.namespace,
                &self.name,
                move |status| {
                    if status.contexts.is_empty() {
                        status.contexts.push(CorrelationContext::new(name.clone()));
                    }
                    let context = &mut status.contexts[0];
                    context.offset = context.offset.max(offset);
                },
            )
            .await?
            .ok_or(RepositoryError::NotFound)?;
            Ok(())
        })
    }
}

impl WorkflowExecutionContext for ConnectedWorkflowContext {
    fn state(&self) -> &ExecutionState {
        &self.state
    }

    fn start(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let pending = self.state.snapshot().await.status.phase == WorkflowInstanceStatusPhase::Pending;
            self.state.start().await?;
            if pending {
                self.record_started().await;
            }
            Ok(())
        })
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.state.cancel().await?;
            self.record_ended().await;
            Ok(())
        })
    }

    fn set_result(&self, output: serde_json::Value) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.state.set_result(output).await?;
            self.record_ended().await;
            Ok(())
        })
    }

    fn set_error(&self, error: ErrorDetails) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.state.set_error(error).await?;
            self.record_ended().await;
            Ok(())
        })
    }

    fn correlate<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, Result<CorrelationContext, EngineError>> {
        Box::pin(self.correlate_remote(task, listener, cancellation))
    }

    fn stream<'a>(
        &'a self,
        task: &'a TaskInstance,
        listener: &'a ListenerDefinition,
        cancellation: CancellationToken,
    ) -> BoxStream<'a, Result<StreamedEvent, EngineError>> {
        Box::pin(self.stream_remote(task, listener, cancellation))
    }

    fn publish(&self, event: CloudEvent) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.services.publisher.publish_boxed(&event).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::definition::{
        EventConsumptionStrategy, EventFilter, ListenTaskDefinition, TaskDefinition, TaskKind,
        TaskList,
    };
    use weft_types::instance::{WorkflowDefinitionReference, WorkflowInstanceSpec};

    use super::*;
    use crate::repository::ResourceRepository;
    use crate::repository::memory::{
        MemoryCloudEventPublisher, MemoryDocumentRepository, MemoryResourceRepository,
    };
    use crate::workflow::expression::JexlEvaluator;
    use crate::workflow::factory::TaskExecutorFactory;
    use crate::workflow::runner::{WorkflowExecutor, WorkflowOutcome};

    struct Fixture {
        instances: Arc<MemoryResourceRepository<WorkflowInstance>>,
        workflows: Arc<MemoryResourceRepository<Workflow>>,
        correlations: Arc<MemoryResourceRepository<Correlation>>,
        publisher: Arc<MemoryCloudEventPublisher>,
        services: ConnectedServices,
    }

    fn fixture() -> Fixture {
        let instances = Arc::new(MemoryResourceRepository::new());
        let workflows = Arc::new(MemoryResourceRepository::new());
        let correlations = Arc::new(MemoryResourceRepository::new());
        let publisher = Arc::new(MemoryCloudEventPublisher::new());
        let services = ConnectedServices {
            documents: Arc::new(MemoryDocumentRepository::new()),
            instances: instances.clone(),
            workflows: workflows.clone(),
            correlations: correlations.clone(),
            publisher: publisher.clone(),
        };
        Fixture {
            instances,
            workflows,
            correlations,
            publisher,
            services,
        }
    }

    fn orders(tasks: TaskList) -> WorkflowDefinition {
        WorkflowDefinition::new("shop", "orders", "1.0.0", tasks)
    }

    async fn connect(fixture: &Fixture, definition: WorkflowDefinition) -> Arc<ConnectedWorkflowContext> {
        fixture
            .workflows
            .create(&Workflow::new(definition.clone()))
            .await
            .unwrap();
        let instance = WorkflowInstance::new(
            ResourceMetadata::new("shop", "orders-1"),
            WorkflowInstanceSpec {
                definition: WorkflowDefinitionReference {
                    namespace: "shop".into(),
                    name: "orders".into(),
                    version: "1.0.0".into(),
                },
                input: Some(json!({"order": "A-1"})),
            },
        );
        let stored = fixture.instances.create(&instance).await.unwrap();
        ConnectedWorkflowContext::new(
            Arc::new(definition),
            stored,
            EngineConfig::default(),
            Arc::new(JexlEvaluator::new()),
            fixture.services.clone(),
        )
    }

    fn listen_for(type_: &str) -> ListenerDefinition {
        ListenerDefinition {
            to: EventConsumptionStrategy {
                any: Some(vec![EventFilter::default().with_attribute("type", type_)]),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_run_persists_through_conflicts_and_records_statistics() {
        let fixture = fixture();
        let context = connect(
            &fixture,
            orders(
                TaskList::new()
                    .with("price", TaskDefinition::set(json!({"total": "42"})))
                    .with("confirm", TaskDefinition::set(json!({"confirmed": "${ data.total }"}))),
            ),
        )
        .await;
        fixture.instances.inject_conflicts(3);

        let outcome = WorkflowExecutor::new(context.clone(), TaskExecutorFactory::default())
            .execute()
            .await
            .unwrap();

        assert_eq!(outcome, WorkflowOutcome::Completed(json!({"confirmed": "42"})));
        let stored = fixture.instances.get("shop", "orders-1").await.unwrap().unwrap();
        assert_eq!(stored.status, context.state().snapshot().await.status);
        assert_eq!(stored.status.phase, WorkflowInstanceStatusPhase::Completed);
        assert_eq!(stored.status.tasks.len(), 2);

        let workflow = fixture.workflows.get("shop", "orders").await.unwrap().unwrap();
        let stats = &workflow.status.versions["1.0.0"];
        assert_eq!(stats.total_instances, 1);
        assert!(stats.last_started_at.is_some());
        assert!(stats.last_ended_at.is_some());
        assert!(fixture.publisher.event_types().len() >= 4);
    }

    #[tokio::test]
    async fn test_blocking_correlation_resolves_from_instance_watch() {
        let fixture = fixture();
        let listen = TaskDefinition::new(TaskKind::Listen(ListenTaskDefinition {
            listen: listen_for("com.example.paid"),
            foreach: None,
        }));
        let context = connect(&fixture, orders(TaskList::new().with("await-payment", listen))).await;
        let executor = Arc::new(WorkflowExecutor::new(context.clone(), TaskExecutorFactory::default()));
        let running = Arc::clone(&executor);
        let handle = tokio::spawn(async move { running.execute().await });

        while fixture.correlations.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let mut resolved = CorrelationContext::new("ctx-1");
        resolved
            .events
            .push(CloudEvent::new("https://payments.example.com", "com.example.paid"));
        fixture
            .instances
            .replace_status("shop", "orders-1", |status| {
                status
                    .correlation
                    .contexts
                    .insert("/do/0/await-payment".into(), resolved.clone());
            })
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        let WorkflowOutcome::Completed(output) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(output[0]["type"], "com.example.paid");
        assert!(fixture.correlations.is_empty(), "ephemeral correlation not deleted");
    }

    #[tokio::test]
    async fn test_correlation_created_before_restart_is_deleted() {
        let fixture = fixture();
        let listen = TaskDefinition::new(TaskKind::Listen(ListenTaskDefinition {
            listen: listen_for("com.example.paid"),
            foreach: None,
        }));
        let definition = orders(TaskList::new().with("await-payment", listen));
        let context = connect(&fixture, definition.clone()).await;
        let executor = Arc::new(WorkflowExecutor::new(context, TaskExecutorFactory::default()));
        let running = Arc::clone(&executor);
        let handle = tokio::spawn(async move { running.execute().await });
        while fixture.correlations.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // The process dies, then the correlator records the context.
        handle.abort();
        let _ = handle.await;
        fixture
            .instances
            .replace_status("shop", "orders-1", |status| {
                status
                    .correlation
                    .contexts
                    .insert("/do/0/await-payment".into(), CorrelationContext::new("ctx-1"));
            })
            .unwrap();

        let restarted = ConnectedWorkflowContext::load(
            "shop",
            "orders-1",
            Arc::new(definition),
            EngineConfig::default(),
            Arc::new(JexlEvaluator::new()),
            fixture.services.clone(),
        )
        .await
        .unwrap();
        let outcome = WorkflowExecutor::new(restarted, TaskExecutorFactory::default())
            .execute()
            .await
            .unwrap();

        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
        assert!(fixture.correlations.is_empty(), "correlation outlived the workflow");
    }

    #[tokio::test]
    async fn test_concurrent_starts_count_every_instance() {
        let fixture = fixture();
        let definition = orders(TaskList::new().with("noop", TaskDefinition::set(json!({}))));
        let first = connect(&fixture, definition.clone()).await;
        let second = fixture
            .instances
            .create(&WorkflowInstance::new(
                ResourceMetadata::new("shop", "orders-2"),
                WorkflowInstanceSpec {
                    definition: WorkflowDefinitionReference {
                        namespace: "shop".into(),
                        name: "orders".into(),
                        version: "1.0.0".into(),
                    },
                    input: None,
                },
            ))
            .await
            .unwrap();
        let second = ConnectedWorkflowContext::new(
            Arc::new(definition),
            second,
            EngineConfig::default(),
            Arc::new(JexlEvaluator::new()),
            fixture.services.clone(),
        );
        fixture.workflows.inject_conflicts(3);

        let first_executor = WorkflowExecutor::new(first, TaskExecutorFactory::default());
        let second_executor = WorkflowExecutor::new(second, TaskExecutorFactory::default());
        let (a, b) = tokio::join!(first_executor.execute(), second_executor.execute());
        assert!(matches!(a.unwrap(), WorkflowOutcome::Completed(_)));
        assert!(matches!(b.unwrap(), WorkflowOutcome::Completed(_)));

        let workflow = fixture.workflows.get("shop", "orders").await.unwrap().unwrap();
        let stats = &workflow.status.versions["1.0.0"];
        assert_eq!(stats.total_instances, 2);
        assert!(stats.last_ended_at.is_some());
    }

    #[tokio::test]
    async fn test_stream_never_redelivers_after_reconnect() {
        let fixture = fixture();
        let context = connect(&fixture, orders(TaskList::new().with("noop", TaskDefinition::set(json!({}))))).await;
        let task = TaskInstance::new("collect", "/do/0/collect", None, false);
        let listener = listen_for("com.example.reading");
        let correlation = Correlation::name_for("orders-1", &task.id);

        let reading = |n: &str| {
            CloudEvent::new("https://sensors.example.com", "com.example.reading")
                .with_data(json!({"n": n}))
        };
        let mut seeded = CorrelationContext::new("ctx");
        seeded.events = vec![reading("1"), reading("2")];
        fixture
            .correlations
            .create(&Correlation {
                metadata: ResourceMetadata::new("shop", correlation.clone()),
                spec: CorrelationSpec {
                    source: ResourceReference::new("shop", "orders-1"),
                    lifetime: CorrelationLifetime::Ephemeral,
                    events: listener.to.clone(),
                    stream: true,
                    outcome: CorrelationOutcome {
                        instance: ResourceReference::new("shop", "orders-1"),
                        task: task.reference.clone(),
                    },
                },
                status: CorrelationStatus {
                    contexts: vec![seeded],
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let cancellation = CancellationToken::new();
        let mut stream = context.stream(&task, &listener, cancellation.clone());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);
        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.offset, 2);
        second.ack().await.unwrap();

        fixture.correlations.disconnect_watchers();
        fixture.instances.disconnect_watchers();
        fixture
            .correlations
            .replace_status("shop", &correlation, |status| {
                status.contexts[0].events.push(reading("3"));
            })
            .unwrap();

        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.offset, 3);
        assert_eq!(third.event.data, Some(json!({"n": "3"})));
        third.ack().await.unwrap();

        fixture
            .instances
            .replace_status("shop", "orders-1", |status| {
                status
                    .correlation
                    .contexts
                    .insert(task.reference.clone(), CorrelationContext::new("ctx"));
            })
            .unwrap();
        assert!(stream.next().await.is_none());

        let stored = fixture
            .correlations
            .get("shop", &correlation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status.contexts[0].offset, 3);
    }
}
