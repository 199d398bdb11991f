//! Metrics command - execution statistics
//!
//! Attempt durations live in the worker pool's process; they are read from
//! the pool's registry heartbeat, so they are only as fresh as the last beat.

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use comfy_table::Cell;
use queuectl_queue::{ExecutionStats, JobStore, MetricsReport};

use super::new_table;
use crate::settings::Settings;

/// Arguments for the metrics command
#[derive(Args)]
pub struct MetricsArgs {
    /// Print in Prometheus text exposition format
    #[arg(long)]
    prometheus: bool,

    /// Print JSON
    #[arg(long, conflicts_with = "prometheus")]
    json: bool,
}

pub async fn run(args: MetricsArgs, settings: &Settings) -> Result<()> {
    let store = settings.open_store().await?;
    let record = settings.registry().read_running()?;
    let report = MetricsReport {
        jobs: store.get_stats().await?,
        execution: record
            .as_ref()
            .map(|r| r.execution)
            .unwrap_or_else(ExecutionStats::default),
        generated_at: Utc::now(),
    };

    if args.prometheus {
        print!("{}", report.to_prometheus());
        return Ok(());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "📈 Execution Metrics".bold().cyan());
    if record.is_none() {
        println!("{}", "No worker pool running; showing job counts only".dimmed());
    }

    let exec = &report.execution;
    let mut table = new_table(&["Metric", "Value"]);
    table.add_row(vec![Cell::new("Attempts"), Cell::new(exec.total_executions)]);
    table.add_row(vec![Cell::new("Succeeded"), Cell::new(exec.succeeded)]);
    table.add_row(vec![Cell::new("Failed"), Cell::new(exec.failed)]);
    table.add_row(vec![
        Cell::new("Avg duration"),
        Cell::new(format!("{:.3}s", exec.avg_execution_secs)),
    ]);
    table.add_row(vec![
        Cell::new("Min duration"),
        Cell::new(format!("{:.3}s", exec.min_execution_secs)),
    ]);
    table.add_row(vec![
        Cell::new("Max duration"),
        Cell::new(format!("{:.3}s", exec.max_execution_secs)),
    ]);
    table.add_row(vec![Cell::new("Jobs total"), Cell::new(report.jobs.total)]);
    table.add_row(vec![Cell::new("Dead jobs"), Cell::new(report.jobs.dead)]);
    println!("{table}");

    Ok(())
}
