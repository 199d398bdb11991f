//! Worker command - run or stop the worker pool
//!
//! Usage:
//! ```bash
//! queuectl worker start --count 3
//! queuectl worker stop
//! ```

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use queuectl_queue::{Scheduler, StopOutcome, WorkerManager};
use std::sync::Arc;
use tracing::info;

use super::shutdown_signal;
use crate::settings::Settings;
use crate::{print_info, print_success, print_warning};

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    #[command(subcommand)]
    command: WorkerCommand,
}

impl WorkerArgs {
    pub fn is_start(&self) -> bool {
        matches!(self.command, WorkerCommand::Start { .. })
    }
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Run workers in the foreground until interrupted or stopped
    #[command(name = "start")]
    Start {
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },

    /// Gracefully stop the running pool
    #[command(name = "stop")]
    Stop,
}

pub async fn run(args: WorkerArgs, settings: &Settings) -> Result<()> {
    match args.command {
        WorkerCommand::Start { count } => start(count, settings).await,
        WorkerCommand::Stop => stop(settings),
    }
}

async fn start(count: usize, settings: &Settings) -> Result<()> {
    let registry = settings.registry();
    if let Some(record) = registry.read_live()? {
        bail!(
            "A worker pool is already running (pid {}, {} workers)",
            record.pid,
            record.worker_count
        );
    }

    let store = Arc::new(settings.open_store().await?);
    let scheduler = Arc::new(Scheduler::new(store, &settings.queue)?);
    let mut pool = WorkerManager::new(scheduler.clone(), settings.queue.poll_interval())
        .with_registry(registry);

    pool.start(count).await?;
    print_success(&format!(
        "Started {} worker(s) (pid {}). Press Ctrl+C or run {} to stop.",
        count,
        std::process::id(),
        "queuectl worker stop".green()
    ));

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = pool.wait_for_shutdown() => {}
    }

    print_info("Shutting down, waiting for in-flight jobs to finish...");
    pool.stop().await?;

    let stats = scheduler.metrics().snapshot();
    info!(
        executions = stats.total_executions,
        succeeded = stats.succeeded,
        failed = stats.failed,
        avg_execution_secs = stats.avg_execution_secs,
        "Worker pool exited"
    );
    print_success(&format!(
        "Stopped. {} attempt(s): {} succeeded, {} failed",
        stats.total_executions, stats.succeeded, stats.failed
    ));
    Ok(())
}

fn stop(settings: &Settings) -> Result<()> {
    match settings.registry().signal_stop()? {
        StopOutcome::Signalled(pid) => {
            print_success(&format!("Sent stop signal to worker pool (pid {})", pid));
        }
        StopOutcome::Stale(pid) => {
            print_warning(&format!(
                "Worker pool (pid {}) is no longer running; cleared its registry entry",
                pid
            ));
        }
        StopOutcome::NotRunning => print_info("No worker pool is running"),
    }
    Ok(())
}
