//! Weft command-line entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler.

mod cli;

use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let otel = matches!(&cli.command, Commands::Run(args) if args.otel);
    weft_observe::init_tracing(cli::log_directives(cli.verbose, cli.quiet), otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Run(args) => cli::run::run_workflow(args).await,
        Commands::Validate { file } => cli::validate::validate_file(&file, cli.json),
    };

    weft_observe::shutdown_tracing();
    result
}
