//! Workflow execution runtime.
//!
//! Layering, bottom-up:
//! - `definition` / `expression` / `functions`: static inputs to a run.
//! - `state`: the single mutex-guarded owner of a `WorkflowInstance`.
//! - `context` (+ `connected`, `standalone`): the execution-context contract
//!   and its two backends.
//! - `task_context` / `executor` / `factory` / `sequence` / `tasks`: the
//!   per-task state machine and the behavior of each task kind.
//! - `runner`: the top-level workflow driver.

pub mod connected;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod factory;
pub mod functions;
pub mod runner;
pub mod sequence;
pub mod standalone;
pub mod state;
pub mod task_context;
pub mod tasks;

pub use connected::{ConnectedServices, ConnectedWorkflowContext};
pub use context::{CreateTaskRequest, OffsetAcknowledger, StreamedEvent, WorkflowExecutionContext};
pub use error::EngineError;
pub use executor::{TaskExecutor, TaskExecutorEvent, TaskOutcome};
pub use factory::TaskExecutorFactory;
pub use runner::{WorkflowExecutor, WorkflowOutcome};
pub use standalone::{StandaloneWorkflowContext, StandaloneWorkflowContextBuilder};
