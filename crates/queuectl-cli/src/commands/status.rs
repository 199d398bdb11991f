//! Status command - queue overview

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{Cell, Color};
use queuectl_queue::{JobState, JobStore, RegistryRecord};

use super::{colored_state, format_time, new_table, state_color};
use crate::settings::Settings;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,
}

pub async fn run(args: StatusArgs, settings: &Settings) -> Result<()> {
    let store = settings.open_store().await?;
    let stats = store.get_stats().await?;
    let record = settings.registry().read_running()?;

    if args.json {
        let status = serde_json::json!({
            "jobs": stats,
            "workers": record,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "📋 Queue Status".bold().cyan());
    println!();

    let mut table = new_table(&["State", "Jobs"]);
    for state in JobState::ALL {
        table.add_row(vec![
            Cell::new(state).fg(state_color(state)),
            Cell::new(stats.count(state)),
        ]);
    }
    table.add_row(vec![Cell::new("total"), Cell::new(stats.total)]);
    println!("{table}");
    println!();

    match record {
        Some(record) => print_pool(&record),
        None => println!("{} no worker pool running", "Workers:".bold()),
    }

    Ok(())
}

fn print_pool(record: &RegistryRecord) {
    println!(
        "{} {} running (pid {}, since {})",
        "Workers:".bold(),
        record.worker_count,
        record.pid,
        format_time(record.started_at)
    );
    println!("  last heartbeat at {}", format_time(record.heartbeat_at));

    let mut table = new_table(&["Worker", "Status", "Current job", "Processed", "Unrecorded"]);
    for worker in &record.workers {
        let (status, color) = if worker.current_job.is_some() {
            ("busy", Color::Blue)
        } else if worker.running {
            ("idle", Color::Green)
        } else {
            ("stopped", Color::Red)
        };
        table.add_row(vec![
            Cell::new(worker.id),
            Cell::new(status).fg(color),
            Cell::new(worker.current_job.as_deref().unwrap_or("-")),
            Cell::new(worker.jobs_processed),
            Cell::new(worker.jobs_unrecorded),
        ]);
    }
    println!("{table}");

    let exec = &record.execution;
    println!(
        "{} {} attempt(s), {} {}, {} {}, avg {:.3}s",
        "Executions:".bold(),
        exec.total_executions,
        exec.succeeded,
        colored_state(JobState::Completed),
        exec.failed,
        colored_state(JobState::Failed),
        exec.avg_execution_secs
    );
}
