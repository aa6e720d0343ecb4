//! `weft run`: execute a workflow file with the stand-alone runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde_json::{Value, json};
use weft_core::repository::{CloudEventPublisherDyn, DocumentRepositoryDyn};
use weft_core::workflow::definition::load_workflow_file;
use weft_core::workflow::functions::FunctionRegistry;
use weft_core::workflow::{
    StandaloneWorkflowContext, TaskExecutorFactory, WorkflowExecutionContext, WorkflowExecutor,
    WorkflowOutcome,
};
use weft_infra::config::{CONFIG_FILE_NAME, default_data_dir, load_engine_config};
use weft_infra::http::HttpCloudEventPublisher;
use weft_infra::sqlite::{DatabasePool, SqliteDocumentRepository};
use weft_types::config::EngineConfig;
use weft_types::definition::WorkflowDefinition;
use weft_types::event::CloudEvent;
use weft_types::instance::WorkflowInstanceStatusPhase;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML or JSON file.
    pub file: PathBuf,

    /// Workflow input as a JSON document.
    #[arg(long)]
    pub input: Option<String>,

    /// Engine configuration file (defaults to `$WEFT_DATA_DIR/weft.toml`).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Store documents in this SQLite database instead of memory.
    #[arg(long)]
    pub database: Option<String>,

    /// CloudEvent (JSON) delivered to the workflow once it waits for events.
    /// May be repeated; events are delivered in order.
    #[arg(long = "event")]
    pub events: Vec<String>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long)]
    pub otel: bool,
}

/// Everything a run needs besides the definition.
struct RunOptions {
    input: Value,
    config: EngineConfig,
    documents: Option<Arc<dyn DocumentRepositoryDyn>>,
    sink: Option<Arc<dyn CloudEventPublisherDyn>>,
    events: Vec<CloudEvent>,
}

pub async fn run_workflow(args: RunArgs) -> Result<()> {
    let definition = load_workflow_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_data_dir().join(CONFIG_FILE_NAME));
    let config = load_engine_config(&config_path).await;

    let documents: Option<Arc<dyn DocumentRepositoryDyn>> = match &args.database {
        Some(url) => {
            let pool = DatabasePool::new(url)
                .await
                .with_context(|| format!("failed to open database {url}"))?;
            Some(Arc::new(SqliteDocumentRepository::new(pool)))
        }
        None => None,
    };

    let sink: Option<Arc<dyn CloudEventPublisherDyn>> = match &config.lifecycle_sink {
        Some(endpoint) => Some(Arc::new(
            HttpCloudEventPublisher::new(endpoint.clone())
                .context("failed to build lifecycle event client")?,
        )),
        None => None,
    };

    let options = RunOptions {
        input: parse_input(args.input.as_deref())?,
        config,
        documents,
        sink,
        events: args
            .events
            .iter()
            .map(|raw| parse_event(raw))
            .collect::<Result<_>>()?,
    };

    let (instance, outcome) = execute(definition, options).await?;
    report(&instance, outcome)
}

fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON"),
        None => Ok(json!({})),
    }
}

fn parse_event(raw: &str) -> Result<CloudEvent> {
    let attributes = serde_json::from_str(raw).context("--event is not a JSON object")?;
    CloudEvent::from_attributes(attributes).map_err(|reason| anyhow::anyhow!("invalid --event: {reason}"))
}

async fn execute(definition: WorkflowDefinition, options: RunOptions) -> Result<(String, WorkflowOutcome)> {
    let mut builder = StandaloneWorkflowContext::builder(definition)
        .input(options.input)
        .config(options.config);
    if let Some(documents) = options.documents {
        builder = builder.documents(documents);
    }
    if let Some(sink) = options.sink {
        builder = builder.sink(sink);
    }
    let context = builder.build();
    let instance = context.instance_name().to_string();

    let executor = Arc::new(WorkflowExecutor::new(
        context.clone(),
        TaskExecutorFactory::new(FunctionRegistry::with_builtins()),
    ));

    let feeder = tokio::spawn(deliver_events(Arc::clone(&context), options.events));

    let running = Arc::clone(&executor);
    let mut execution = tokio::spawn(async move { running.execute().await });
    let outcome = tokio::select! {
        joined = &mut execution => joined.context("workflow task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(instance = %instance, "interrupted, cancelling workflow");
            executor.cancel();
            execution.await.context("workflow task panicked")??
        }
    };
    feeder.abort();
    Ok((instance, outcome))
}

/// Publish each event on the local bus once the instance waits for one.
async fn deliver_events(context: Arc<StandaloneWorkflowContext>, events: Vec<CloudEvent>) {
    for event in events {
        loop {
            let phase = context.instance().await.status.phase;
            if phase == WorkflowInstanceStatusPhase::Waiting {
                break;
            }
            if phase.is_terminal() {
                tracing::warn!(event_type = %event.type_, "workflow ended before event was delivered");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::debug!(event_type = %event.type_, "delivering event");
        context.bus().publish(event);
        // Let the listener consume it before checking the phase again.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn report(instance: &str, outcome: WorkflowOutcome) -> Result<()> {
    match outcome {
        WorkflowOutcome::Completed(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        WorkflowOutcome::Faulted(error) => {
            eprintln!("{}", serde_json::to_string_pretty(&error)?);
            bail!("workflow {instance} faulted: {error}")
        }
        WorkflowOutcome::Cancelled => bail!("workflow {instance} was cancelled"),
        WorkflowOutcome::Suspended => bail!("workflow {instance} was suspended"),
    }
}
