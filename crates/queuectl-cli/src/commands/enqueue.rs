//! Enqueue command - submit a job
//!
//! Usage:
//! ```bash
//! queuectl enqueue '{"id":"job1","command":"echo hi"}'
//! queuectl enqueue '{"id":"nightly","command":"./backup.sh","priority":5,"run_at":"2030-01-01T02:00:00Z"}'
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use queuectl_queue::{JobStore, JobSubmission};

use crate::print_success;
use crate::settings::Settings;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job description: id and command, optionally max_retries, priority,
    /// run_at (RFC 3339) and timeout (seconds)
    job: String,
}

pub async fn run(args: EnqueueArgs, settings: &Settings) -> Result<()> {
    let job = JobSubmission::parse(&args.job)
        .and_then(|submission| submission.into_job(&settings.queue, Utc::now()))
        .context("Job rejected")?;

    let store = settings.open_store().await?;
    store.add_job(&job).await.context("Job rejected")?;

    print_success(&format!("Enqueued job '{}'", job.id.green()));
    println!("  {} {}", "Command:".dimmed(), job.command);
    println!(
        "  {} {}   {} {}   {} {}s",
        "Priority:".dimmed(),
        job.priority,
        "Max retries:".dimmed(),
        job.max_retries,
        "Timeout:".dimmed(),
        job.timeout_secs
    );
    if let Some(run_at) = job.run_at {
        println!("  {} {}", "Runs at:".dimmed(), super::format_time(run_at));
    }

    Ok(())
}
