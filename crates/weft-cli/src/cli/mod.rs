//! CLI command definitions for the `weft` binary.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use run::RunArgs;

/// Run and validate workflow definitions.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file in-process and print its output.
    Run(RunArgs),

    /// Parse and validate a workflow file without running it.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },
}

/// Log filter directives for a verbosity level.
pub fn log_directives(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,weft_core=debug",
        _ => "trace",
    }
}
