//! Ludic command-line tool
//!
//! Prints the tables the bridge is bootstrapped from for a given host build:
//! record layouts, runtime services and constants.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::TargetArgs;

#[derive(Parser)]
#[command(name = "ludic")]
#[command(about = "Inspect the native bridge tables of a host runtime build", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record layouts
    Layout {
        /// Record to show (lists all records if omitted)
        record: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show runtime services and their advisory signatures
    Services {
        #[command(flatten)]
        target: TargetArgs,
        /// Include services the bridge provides itself
        #[arg(long)]
        all: bool,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show numeric constants
    Constants {
        #[command(flatten)]
        target: TargetArgs,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved build configuration and environment
    Info {
        #[command(flatten)]
        target: TargetArgs,
    },
}

fn main() -> ExitCode {
    // Initialize tracing if LUDIC_LOG is set
    if let Ok(filter) = EnvFilter::try_from_env("LUDIC_LOG") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
        tracing::debug!("tracing initialized");
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Layout { record, target, json } => {
            commands::layout::execute(&target, record.as_deref(), json)
        }
        Commands::Services { target, all, json } => commands::services::execute(&target, all, json),
        Commands::Constants { target, json } => commands::constants::execute(&target, json),
        Commands::Info { target } => commands::info::execute(&target),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
