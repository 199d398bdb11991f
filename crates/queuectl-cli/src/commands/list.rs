//! List command - table of jobs

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use queuectl_queue::{JobFilter, JobState, JobStore};

use super::jobs_table;
use crate::settings::Settings;

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Only jobs in this state (pending, processing, completed, failed, dead)
    #[arg(short, long)]
    state: Option<JobState>,

    /// Maximum number of jobs to show, newest first
    #[arg(short, long, default_value_t = 20)]
    limit: u32,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

pub async fn run(args: ListArgs, settings: &Settings) -> Result<()> {
    let store = settings.open_store().await?;
    let filter = JobFilter {
        state: args.state,
        limit: Some(args.limit),
    };
    let jobs = store.list_jobs(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        match args.state {
            Some(state) => println!("No {} jobs", state),
            None => println!("No jobs"),
        }
        return Ok(());
    }

    println!("{}", jobs_table(&jobs));
    println!("{}", format!("Showing {} job(s)", jobs.len()).dimmed());
    Ok(())
}
