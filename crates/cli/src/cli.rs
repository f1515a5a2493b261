use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Replay task scheduling scenarios against the lanesched engine.
///
/// A scenario file declares queues, time domains, tasks to post and
/// driver steps (pumps, virtual time advances, idle periods). The replay
/// prints the order in which tasks ran followed by a JSON report.
#[derive(Parser, Debug)]
#[command(name = "lanesched", about = "Replay task scheduling scenarios")]
pub struct CliArgs {
    /// Scheduler config file (TOML). LANESCHED_* env vars override it.
    #[arg(long, global = true, env = "LANESCHED_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a scenario file
    Run {
        /// Path to the scenario TOML
        scenario: PathBuf,

        /// Run on the wall clock with a tokio host instead of the simulated clock
        #[arg(long)]
        realtime: bool,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Only print the JSON report
        #[arg(long)]
        quiet: bool,
    },

    /// Parse and validate a scenario without running it
    Check {
        /// Path to the scenario TOML
        scenario: PathBuf,
    },

    /// Print the effective scheduler config as JSON
    Config,
}
