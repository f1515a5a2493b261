mod cli;
mod realtime;
mod replay;
mod scenario;
mod world;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use lanesched_core::SchedulerConfig;
use tracing::info;

use crate::cli::{CliArgs, Command};
use crate::scenario::Scenario;
use crate::world::Report;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    lanesched_core::load_dotenv();
    let args = CliArgs::parse();

    let config = SchedulerConfig::load(args.config.as_deref())
        .context("failed to load scheduler configuration")?;
    config.log_summary();

    match args.command {
        Command::Run { scenario, realtime, output, quiet } => {
            let scenario = Scenario::from_file(&scenario)?;
            info!("Replaying scenario '{}' (realtime: {})", scenario.name, realtime);
            let report = if realtime {
                realtime::run_realtime(&scenario, &config).await?
            } else {
                replay::run_virtual(&scenario, &config)?
            };
            if !quiet {
                print_executions(&report);
            }
            write_report(&report, output.as_deref())?;
        }
        Command::Check { scenario } => {
            let scenario = Scenario::from_file(&scenario)?;
            println!(
                "Scenario '{}' is valid: {} queues, {} tasks, {} idle tasks, {} steps",
                scenario.name,
                scenario.queues.len(),
                scenario.tasks.len(),
                scenario.idle_tasks.len(),
                scenario.steps.len()
            );
        }
        Command::Config => {
            let json = serde_json::to_string_pretty(&config.summary())
                .context("failed to serialize config")?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn print_executions(report: &Report) {
    println!("Execution order ({} mode):", report.mode);
    for execution in &report.executions {
        match execution.deadline_ms {
            Some(deadline) => println!(
                "  {:>9.3}ms  {:<16} {} (deadline {:.3}ms)",
                execution.started_ms, execution.queue, execution.label, deadline
            ),
            None => println!(
                "  {:>9.3}ms  {:<16} {}",
                execution.started_ms, execution.queue, execution.label
            ),
        }
    }
    let still_pending: usize = report.pending.values().sum();
    if still_pending > 0 {
        println!("  ({} tasks still pending)", still_pending);
    }
    println!();
}

fn write_report(report: &Report, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write report: {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
