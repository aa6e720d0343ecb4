//! Per-task state machine.
//!
//! A [`TaskExecutor`] drives one task instance through
//! `Pending -> Running -> {Completed | Faulted | Suspended | Cancelled | Skipped}`.
//! Kind-specific work is delegated to a [`TaskBehavior`]; everything else
//! (guards, timeouts, extension hooks, output and export filters, child
//! tracking, cancellation) lives here so that every kind gets it uniformly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_types::definition::{FlowDirective, TaskDefinition, TaskList};
use weft_types::error::ErrorDetails;
use weft_types::instance::{TaskInstance, TaskInstanceStatus};

use super::error::EngineError;
use super::expression::{ExpressionEvaluator, evaluate_condition, evaluate_template};
use super::factory::TaskExecutorFactory;
use super::task_context::TaskExecutionContext;

/// Final signal released by an executor's completion latch.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { output: Value, then: FlowDirective },
    Skipped { output: Value },
    Faulted(ErrorDetails),
    Cancelled,
    Suspended,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskInstanceStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskInstanceStatus::Completed,
            TaskOutcome::Skipped { .. } => TaskInstanceStatus::Skipped,
            TaskOutcome::Faulted(_) => TaskInstanceStatus::Faulted,
            TaskOutcome::Cancelled => TaskInstanceStatus::Cancelled,
            TaskOutcome::Suspended => TaskInstanceStatus::Suspended,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Completed { output, .. } | TaskOutcome::Skipped { output } => Some(output),
            _ => None,
        }
    }
}

/// Lifecycle notifications published by an executor, in transition order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskExecutorEvent {
    Initialized,
    Running,
    Retrying(u32),
    Suspended,
    Skipped,
    Faulted(ErrorDetails),
    Cancelled,
    Completed,
}

/// Result of one execution of a task kind's body.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// `then` overrides the definition's own flow directive.
    Complete {
        output: Value,
        then: Option<FlowDirective>,
    },
    Fault(ErrorDetails),
    Suspend,
    Cancel,
}

impl StepResult {
    pub fn complete(output: Value) -> Self {
        StepResult::Complete { output, then: None }
    }
}

/// Kind-specific behavior plugged into a [`TaskExecutor`].
pub trait TaskBehavior: Send + Sync {
    fn initialize(&self, _executor: Arc<TaskExecutor>) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    /// Run the task body against `input`. Called once per attempt.
    fn execute(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>>;

    /// Run a new attempt after a retry was recorded.
    fn retry(
        &self,
        executor: Arc<TaskExecutor>,
        input: Value,
    ) -> BoxFuture<'_, Result<StepResult, EngineError>> {
        self.execute(executor, input)
    }

    /// Called before the task is marked `Suspended`.
    fn suspend(&self, _executor: Arc<TaskExecutor>) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    /// Called before a fault is persisted, after children were cancelled.
    fn on_fault<'a>(
        &'a self,
        _executor: Arc<TaskExecutor>,
        _error: &'a ErrorDetails,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Definition of a child task to materialize under an executor.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub name: String,
    pub definition: TaskDefinition,
    pub path: String,
    pub input: Value,
    pub context: Option<Value>,
    pub is_extension: bool,
}

#[derive(Debug, Clone, Copy)]
enum HookPhase {
    Before,
    After,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        }
    }
}

enum HookOutcome {
    Continue(Value),
    /// A hook completed with `exit`: skip the remaining hooks (and the body).
    Exit(Value),
    /// A hook did not complete; the executor has already been transitioned.
    Halted,
}

pub struct TaskExecutor {
    context: TaskExecutionContext,
    behavior: Box<dyn TaskBehavior>,
    factory: TaskExecutorFactory,
    /// Cancellation handed down by the parent.
    cancellation: CancellationToken,
    /// Scope for this task's own work and its children.
    scope: CancellationToken,
    outcome: watch::Sender<Option<TaskOutcome>>,
    events: broadcast::Sender<TaskExecutorEvent>,
    /// Receiver created with the channel, handed to the first subscriber.
    first_subscriber: Mutex<Option<broadcast::Receiver<TaskExecutorEvent>>>,
    children: Mutex<Vec<Arc<TaskExecutor>>>,
    in_extension: bool,
}

impl TaskExecutor {
    pub(crate) fn new(
        context: TaskExecutionContext,
        behavior: Box<dyn TaskBehavior>,
        factory: TaskExecutorFactory,
        cancellation: CancellationToken,
        in_extension: bool,
    ) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        let (events, first_subscriber) = broadcast::channel(32);
        let scope = cancellation.child_token();
        Arc::new(Self {
            context,
            behavior,
            factory,
            cancellation,
            scope,
            outcome,
            events,
            first_subscriber: Mutex::new(Some(first_subscriber)),
            children: Mutex::new(Vec::new()),
            in_extension,
        })
    }

    pub fn context(&self) -> &TaskExecutionContext {
        &self.context
    }

    pub fn instance(&self) -> TaskInstance {
        self.context.instance()
    }

    pub fn reference(&self) -> String {
        self.context.instance().reference
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.context.workflow().evaluator()
    }

    /// Cancellation scope for work performed on behalf of this task.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Whether this task runs inside an extension hook.
    pub fn in_extension(&self) -> bool {
        self.in_extension
    }

    /// Lifecycle events of this executor.
    ///
    /// The first subscriber sees every event since creation, `Initialized`
    /// included; later subscribers see events from the time they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskExecutorEvent> {
        self.first_subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    pub fn is_released(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub async fn initialize(self: &Arc<Self>) -> Result<(), EngineError> {
        self.context.initialize().await?;
        self.behavior.initialize(Arc::clone(self)).await?;
        self.emit(TaskExecutorEvent::Initialized);
        Ok(())
    }

    /// Drive the task to an outcome.
    ///
    /// Re-entering an executor whose instance is already terminal returns the
    /// recorded outcome without side effects.
    pub fn execute(self: &Arc<Self>) -> BoxFuture<'static, Result<TaskOutcome, EngineError>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) -> Result<TaskOutcome, EngineError> {
        let instance = self.context.refresh().await?;
        if instance.status.is_terminal() {
            debug!(
                task_id = %instance.id,
                reference = %instance.reference,
                status = %instance.status,
                "task already terminal"
            );
            self.release_from(&instance).await?;
            return self.outcome().await;
        }

        if instance.status == TaskInstanceStatus::Pending {
            if let Some(condition) = &self.context.definition().if_ {
                let input = self.context.input().clone();
                let arguments = self.context.arguments();
                match evaluate_condition(self.evaluator(), condition, &input, &arguments) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip(input).await?;
                        return self.outcome().await;
                    }
                    Err(e) => {
                        self.set_error(EngineError::from(e).to_error_details())
                            .await?;
                        return self.outcome().await;
                    }
                }
            }
        }

        let timeout = self.timeout();
        let mut latch = self.outcome.subscribe();
        tokio::select! {
            biased;
            _ = async { let _ = latch.wait_for(Option::is_some).await; } => {}
            _ = self.cancellation.cancelled() => {
                self.cancel().await?;
            }
            _ = sleep_or_pending(timeout) => {
                self.time_out(timeout.unwrap_or_default()).await?;
            }
            result = self.run_body() => {
                if let Err(e) = result {
                    warn!(
                        reference = %self.reference(),
                        error = %e,
                        "task body failed"
                    );
                    self.set_error(e.to_error_details()).await?;
                }
            }
        }
        self.outcome().await
    }

    async fn run_body(self: &Arc<Self>) -> Result<(), EngineError> {
        let instance = self.context.execute().await?;
        if instance.status != TaskInstanceStatus::Running {
            return self.release_from(&instance).await;
        }
        self.emit(TaskExecutorEvent::Running);

        let mut input = self.context.input().clone();
        if !self.in_extension {
            match self.run_hooks(HookPhase::Before, input).await? {
                HookOutcome::Continue(value) => input = value,
                HookOutcome::Exit(output) => {
                    return self.set_result(output, self.default_then()).await;
                }
                HookOutcome::Halted => return Ok(()),
            }
        }

        let step = self.behavior.execute(Arc::clone(self), input).await?;
        self.apply(step).await
    }

    async fn apply(self: &Arc<Self>, step: StepResult) -> Result<(), EngineError> {
        match step {
            StepResult::Complete { output, then } => {
                let then = then.unwrap_or_else(|| self.default_then());
                self.set_result(output, then).await
            }
            StepResult::Fault(error) => self.set_error(error).await,
            StepResult::Suspend => self.suspend().await,
            StepResult::Cancel => self.cancel().await,
        }
    }

    fn default_then(&self) -> FlowDirective {
        self.context.definition().then.clone().unwrap_or_default()
    }

    fn timeout(&self) -> Option<Duration> {
        self.context
            .definition()
            .timeout
            .as_ref()
            .map(|timeout| timeout.after.to_duration())
            .or_else(|| {
                self.context
                    .workflow()
                    .config()
                    .default_task_timeout_secs
                    .map(Duration::from_secs)
            })
    }

    async fn time_out(self: &Arc<Self>, after: Duration) -> Result<(), EngineError> {
        debug!(reference = %self.reference(), ?after, "task timed out");
        self.scope.cancel();
        let error = EngineError::Timeout(after)
            .to_error_details()
            .with_instance(self.reference());
        self.set_error(error).await
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Complete the task. A no-op unless it is `Running`.
    pub async fn set_result(
        self: &Arc<Self>,
        output: Value,
        then: FlowDirective,
    ) -> Result<(), EngineError> {
        let instance = self.context.refresh().await?;
        if instance.status != TaskInstanceStatus::Running {
            debug!(
                reference = %instance.reference,
                status = %instance.status,
                "ignoring result for a task that is not running"
            );
            return self.release_from(&instance).await;
        }

        let definition = self.context.definition();
        let mut arguments = self.context.arguments();
        arguments.insert("output".to_string(), output.clone());

        let mut output = match definition.output.as_ref().and_then(|o| o.as_.as_ref()) {
            Some(filter) => evaluate_template(self.evaluator(), filter, &output, &arguments)?,
            None => output,
        };

        if let Some(export) = definition.export.as_ref().and_then(|e| e.as_.as_ref()) {
            let exported = evaluate_template(self.evaluator(), export, &output, &arguments)?;
            self.context.set_context_data(exported).await?;
        }

        if !self.in_extension {
            match self.run_hooks(HookPhase::After, output).await? {
                HookOutcome::Continue(value) | HookOutcome::Exit(value) => output = value,
                HookOutcome::Halted => return Ok(()),
            }
        }

        let instance = self.context.set_result(output.clone(), then.clone()).await?;
        if instance.status == TaskInstanceStatus::Completed {
            debug!(reference = %instance.reference, then = %then, "task completed");
            if self.release(TaskOutcome::Completed { output, then }) {
                self.emit(TaskExecutorEvent::Completed);
            }
            Ok(())
        } else {
            self.release_from(&instance).await
        }
    }

    pub async fn set_error(self: &Arc<Self>, error: ErrorDetails) -> Result<(), EngineError> {
        let error = match error.instance {
            Some(_) => error,
            None => error.with_instance(self.reference()),
        };
        self.cancel_children().await?;
        if self.context.instance().is_operative() {
            self.behavior.on_fault(Arc::clone(self), &error).await?;
        }
        let instance = self.context.set_error(error).await?;
        match (&instance.status, &instance.error) {
            (TaskInstanceStatus::Faulted, Some(recorded)) => {
                debug!(reference = %instance.reference, error = %recorded, "task faulted");
                if self.release(TaskOutcome::Faulted(recorded.clone())) {
                    self.emit(TaskExecutorEvent::Faulted(recorded.clone()));
                }
                Ok(())
            }
            _ => self.release_from(&instance).await,
        }
    }

    pub async fn skip(self: &Arc<Self>, output: Value) -> Result<(), EngineError> {
        let instance = self.context.skip(output.clone()).await?;
        if instance.status == TaskInstanceStatus::Skipped {
            debug!(reference = %instance.reference, "task skipped");
            if self.release(TaskOutcome::Skipped { output }) {
                self.emit(TaskExecutorEvent::Skipped);
            }
            Ok(())
        } else {
            self.release_from(&instance).await
        }
    }

    /// Record a retry attempt and run the behavior's retry logic.
    pub async fn retry(self: &Arc<Self>, cause: ErrorDetails) -> Result<(), EngineError> {
        let instance = self.record_retry(cause).await?;
        if instance.status != TaskInstanceStatus::Running {
            return self.release_from(&instance).await;
        }
        let input = self.context.input().clone();
        let step = self.behavior.retry(Arc::clone(self), input).await?;
        self.apply(step).await
    }

    /// Record a retry attempt without running the task again. Behaviors that
    /// drive their own attempts call this between them.
    pub(crate) async fn record_retry(
        self: &Arc<Self>,
        cause: ErrorDetails,
    ) -> Result<TaskInstance, EngineError> {
        let instance = self.context.retry(cause).await?;
        if instance.status == TaskInstanceStatus::Running {
            let attempt = instance.retries.len() as u32;
            debug!(reference = %instance.reference, attempt, "task retrying");
            self.emit(TaskExecutorEvent::Retrying(attempt));
        }
        Ok(instance)
    }

    /// Suspend this task and every live child.
    pub fn suspend(self: &Arc<Self>) -> BoxFuture<'static, Result<(), EngineError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            for child in this.live_children() {
                child.suspend().await?;
            }
            if this.context.instance().is_operative() {
                this.behavior.suspend(Arc::clone(&this)).await?;
            }
            let instance = this.context.suspend().await?;
            if instance.status == TaskInstanceStatus::Suspended {
                if this.release(TaskOutcome::Suspended) {
                    this.emit(TaskExecutorEvent::Suspended);
                }
                Ok(())
            } else {
                this.release_from(&instance).await
            }
        })
    }

    /// Cancel this task and every live child.
    pub fn cancel(self: &Arc<Self>) -> BoxFuture<'static, Result<(), EngineError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            this.scope.cancel();
            this.cancel_children().await?;
            let instance = this.context.cancel().await?;
            if instance.status == TaskInstanceStatus::Cancelled {
                debug!(reference = %instance.reference, "task cancelled");
                if this.release(TaskOutcome::Cancelled) {
                    this.emit(TaskExecutorEvent::Cancelled);
                }
                Ok(())
            } else {
                this.release_from(&instance).await
            }
        })
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Materialize a child task, reusing the `occurrence`-th existing
    /// instance with the same reference when re-entering after a resume.
    pub async fn create_child(
        self: &Arc<Self>,
        spec: ChildSpec,
        occurrence: usize,
    ) -> Result<Arc<TaskExecutor>, EngineError> {
        let parent = self.context.instance();
        let child = self
            .factory
            .materialize(
                Arc::clone(self.context.workflow()),
                Some(&parent),
                spec,
                occurrence,
                &self.scope,
                self.in_extension,
            )
            .await?;
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        children.retain(|existing| !existing.is_released());
        children.push(Arc::clone(&child));
        Ok(child)
    }

    fn live_children(&self) -> Vec<Arc<TaskExecutor>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|child| !child.is_released())
            .cloned()
            .collect()
    }

    async fn cancel_children(&self) -> Result<(), EngineError> {
        for child in self.live_children() {
            child.cancel().await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Extension hooks
    // -----------------------------------------------------------------------

    async fn run_hooks(
        self: &Arc<Self>,
        phase: HookPhase,
        mut value: Value,
    ) -> Result<HookOutcome, EngineError> {
        let task_type = self.context.definition().type_name();
        let hooks: Vec<(String, Option<String>, TaskList)> = self
            .context
            .workflow()
            .definition()
            .extensions()
            .filter(|(_, extension)| extension.applies_to(task_type))
            .filter_map(|(name, extension)| {
                let tasks = match phase {
                    HookPhase::Before => extension.before.clone(),
                    HookPhase::After => extension.after.clone(),
                }?;
                Some((name.to_string(), extension.when.clone(), tasks))
            })
            .collect();

        for (name, when, tasks) in hooks {
            if let Some(condition) = &when {
                let arguments = self.context.arguments();
                if !evaluate_condition(self.evaluator(), condition, &value, &arguments)? {
                    continue;
                }
            }
            let spec = ChildSpec {
                name: name.clone(),
                definition: TaskDefinition::do_(tasks),
                path: format!("extensions/{name}/{}", phase.as_str()),
                input: value.clone(),
                context: None,
                is_extension: true,
            };
            let hook = self.create_child(spec, 0).await?;
            match hook.execute().await? {
                TaskOutcome::Completed {
                    output,
                    then: FlowDirective::Exit,
                } => return Ok(HookOutcome::Exit(output)),
                TaskOutcome::Completed { output, .. } | TaskOutcome::Skipped { output } => {
                    value = output;
                }
                TaskOutcome::Faulted(error) => {
                    self.set_error(error).await?;
                    return Ok(HookOutcome::Halted);
                }
                TaskOutcome::Cancelled => {
                    self.cancel().await?;
                    return Ok(HookOutcome::Halted);
                }
                TaskOutcome::Suspended => {
                    self.suspend().await?;
                    return Ok(HookOutcome::Halted);
                }
            }
        }
        Ok(HookOutcome::Continue(value))
    }

    // -----------------------------------------------------------------------
    // Completion latch
    // -----------------------------------------------------------------------

    /// Release the latch. Only the first outcome is kept.
    fn release(&self, outcome: TaskOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    /// Release the latch from a persisted instance, if it has settled.
    async fn release_from(&self, instance: &TaskInstance) -> Result<(), EngineError> {
        let outcome = match instance.status {
            TaskInstanceStatus::Completed => TaskOutcome::Completed {
                output: self.context.output().await?.unwrap_or(Value::Null),
                then: instance.next.clone().unwrap_or_default(),
            },
            TaskInstanceStatus::Skipped => TaskOutcome::Skipped {
                output: self.context.output().await?.unwrap_or(Value::Null),
            },
            TaskInstanceStatus::Faulted => TaskOutcome::Faulted(
                instance
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorDetails::runtime("task faulted without details")),
            ),
            TaskInstanceStatus::Cancelled => TaskOutcome::Cancelled,
            TaskInstanceStatus::Suspended => TaskOutcome::Suspended,
            TaskInstanceStatus::Pending | TaskInstanceStatus::Running => return Ok(()),
        };
        self.release(outcome);
        Ok(())
    }

    async fn outcome(&self) -> Result<TaskOutcome, EngineError> {
        let mut latch = self.outcome.subscribe();
        let released = latch
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Runtime("task completion latch closed".to_string()))?;
        released
            .as_ref()
            .cloned()
            .ok_or_else(|| EngineError::Runtime("task completion latch empty".to_string()))
    }

    fn emit(&self, event: TaskExecutorEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
