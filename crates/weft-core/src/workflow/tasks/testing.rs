//! Helpers shared by the task behavior tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use weft_types::definition::{TaskList, WorkflowDefinition};
use weft_types::instance::{TaskInstance, WorkflowInstance, WorkflowInstanceStatusPhase};

use crate::event::CloudEventBus;
use crate::workflow::context::WorkflowExecutionContext;
use crate::workflow::factory::TaskExecutorFactory;
use crate::workflow::functions::FunctionRegistry;
use crate::workflow::runner::{WorkflowExecutor, WorkflowOutcome};
use crate::workflow::standalone::StandaloneWorkflowContext;

pub(crate) struct TestRun {
    pub outcome: WorkflowOutcome,
    pub instance: WorkflowInstance,
    /// The workflow output, when it completed.
    pub output: Option<Value>,
    pub context: Arc<StandaloneWorkflowContext>,
}

impl TestRun {
    pub async fn document(&self, id: &str) -> Value {
        self.context.get_document(id).await.expect("document missing")
    }
}

pub(crate) fn definition(tasks: TaskList) -> WorkflowDefinition {
    WorkflowDefinition::new("tests", "under-test", "0.1.0", tasks)
}

pub(crate) async fn run_workflow(tasks: TaskList, input: Value) -> TestRun {
    run_definition(
        definition(tasks),
        input,
        FunctionRegistry::with_builtins(),
        CloudEventBus::new(64),
    )
    .await
}

pub(crate) async fn run_definition(
    definition: WorkflowDefinition,
    input: Value,
    functions: FunctionRegistry,
    bus: CloudEventBus,
) -> TestRun {
    let (context, handle) = start_definition(definition, input, functions, bus);
    let outcome = handle.await.expect("workflow task panicked");
    let output = match &outcome {
        WorkflowOutcome::Completed(output) => Some(output.clone()),
        _ => None,
    };
    TestRun {
        outcome,
        instance: context.instance().await,
        output,
        context,
    }
}

/// Spawn a run and hand back its context so the test can interact with it.
pub(crate) fn start_definition(
    definition: WorkflowDefinition,
    input: Value,
    functions: FunctionRegistry,
    bus: CloudEventBus,
) -> (Arc<StandaloneWorkflowContext>, JoinHandle<WorkflowOutcome>) {
    let context = StandaloneWorkflowContext::builder(definition)
        .input(input)
        .bus(bus)
        .build();
    let executor = WorkflowExecutor::new(
        Arc::clone(&context) as Arc<dyn WorkflowExecutionContext>,
        TaskExecutorFactory::new(functions),
    );
    let handle = tokio::spawn(async move { executor.execute().await.expect("workflow errored") });
    (context, handle)
}

pub(crate) async fn wait_for_phase(
    context: &dyn WorkflowExecutionContext,
    phase: WorkflowInstanceStatusPhase,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while context.instance().await.status.phase != phase {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("workflow never reached {phase:?}"));
}

/// First task instance named `name`.
pub(crate) fn task_by_name<'a>(instance: &'a WorkflowInstance, name: &str) -> &'a TaskInstance {
    instance
        .status
        .tasks
        .iter()
        .find(|task| task.name == name)
        .unwrap_or_else(|| panic!("no task named '{name}'"))
}
