//! DLQ command - inspect and retry dead jobs
//!
//! Usage:
//! ```bash
//! queuectl dlq list
//! queuectl dlq retry job1
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use queuectl_queue::{JobStore, QueueError, Scheduler};
use std::sync::Arc;

use super::jobs_table;
use crate::print_success;
use crate::settings::Settings;

/// Arguments for the dlq command
#[derive(Args)]
pub struct DlqArgs {
    #[command(subcommand)]
    command: DlqCommand,
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List jobs that exhausted their retries
    #[command(name = "list")]
    List,

    /// Move a dead job back to pending with its attempts reset
    #[command(name = "retry")]
    Retry {
        /// Job id
        id: String,
    },
}

pub async fn run(args: DlqArgs, settings: &Settings) -> Result<()> {
    let store = Arc::new(settings.open_store().await?);
    match args.command {
        DlqCommand::List => {
            let jobs = store.get_dlq_jobs().await?;
            if jobs.is_empty() {
                println!("Dead letter queue is empty");
                return Ok(());
            }
            println!("{}", "☠ Dead Letter Queue".bold().red());
            println!("{}", jobs_table(&jobs));
            println!(
                "Retry a job: {}",
                "queuectl dlq retry <id>".green()
            );
            Ok(())
        }
        DlqCommand::Retry { id } => {
            let scheduler = Scheduler::new(store, &settings.queue)?;
            let job = scheduler.retry_dead_job(&id).await.map_err(|e| match e {
                QueueError::ClaimConflict(_) => {
                    anyhow::anyhow!("Job '{}' is not in the dead letter queue", id)
                }
                other => anyhow::Error::new(other),
            })
            .with_context(|| format!("Failed to retry job '{}'", id))?;
            print_success(&format!("Job '{}' moved back to {}", job.id, job.state));
            Ok(())
        }
    }
}
