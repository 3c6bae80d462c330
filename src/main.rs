//! iamctl - drive in-app message automation from scenario files
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// iamctl - in-app message automation runner
#[derive(Parser, Debug)]
#[command(name = "iamctl")]
#[command(about = "Run in-app message automation scenarios headlessly", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario file and print NDJSON events to stdout
    Run {
        /// Path to the scenario TOML file
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,

        /// Minimum time between two displays, overriding config and scenario
        #[arg(long, value_name = "MS")]
        display_interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    // Logs go to a file; stdout carries the event stream
    iam_core::logging::init()?;

    match args.command {
        Command::Run {
            scenario,
            display_interval_ms,
        } => inapp_automation::run_headless(&scenario, display_interval_ms).await?,
    }

    Ok(())
}
