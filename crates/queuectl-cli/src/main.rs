//! queuectl - persistent background job queue
//!
//! # Usage
//!
//! ```bash
//! # Submit a job
//! queuectl enqueue '{"id":"job1","command":"sleep 2"}'
//!
//! # Run three workers in the foreground
//! queuectl worker start --count 3
//!
//! # Inspect the queue
//! queuectl status
//! queuectl list --state pending
//! queuectl dlq list
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

mod commands;
mod settings;

use commands::{config, dashboard, dlq, enqueue, list, metrics, status, worker};
use settings::Settings;

/// queuectl - background jobs with retries and a dead letter queue
#[derive(Parser)]
#[command(
    name = "queuectl",
    version,
    about = "queuectl - persistent background job queue",
    long_about = "queuectl runs shell commands as background jobs.\n\n\
                  Jobs are stored in SQLite, claimed atomically by workers,\n\
                  retried with exponential backoff and parked in a dead\n\
                  letter queue once their retries are exhausted."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file [default: ~/.queuectl/config.json]
    #[arg(long, global = true, env = "QUEUECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job from a JSON description
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Start or stop the worker pool
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),

    /// Job counts, workers and execution metrics
    #[command(name = "status")]
    Status(status::StatusArgs),

    /// List jobs
    #[command(name = "list")]
    List(list::ListArgs),

    /// Inspect or retry dead jobs
    #[command(name = "dlq")]
    Dlq(dlq::DlqArgs),

    /// Show or change settings
    #[command(name = "config")]
    Config(config::ConfigArgs),

    /// Execution metrics
    #[command(name = "metrics")]
    Metrics(metrics::MetricsArgs),

    /// Serve a read-only JSON monitoring API
    #[command(name = "dashboard")]
    Dashboard(dashboard::DashboardArgs),
}

impl Commands {
    /// Foreground services log at info by default
    fn min_verbosity(&self) -> u8 {
        match self {
            Commands::Worker(args) if args.is_start() => 1,
            Commands::Dashboard(_) => 1,
            _ => 0,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose.max(cli.command.min_verbosity()), cli.log_format);

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file = cli.config.unwrap_or_else(Settings::default_file);
    let settings = Settings::load(&file)?;

    match cli.command {
        Commands::Enqueue(args) => enqueue::run(args, &settings).await,
        Commands::Worker(args) => worker::run(args, &settings).await,
        Commands::Status(args) => status::run(args, &settings).await,
        Commands::List(args) => list::run(args, &settings).await,
        Commands::Dlq(args) => dlq::run(args, &settings).await,
        Commands::Config(args) => config::run(args, &settings, &file),
        Commands::Metrics(args) => metrics::run(args, &settings).await,
        Commands::Dashboard(args) => dashboard::run(args, &settings).await,
    }
}

/// Setup logging based on verbosity level. Logs go to stderr so command
/// output on stdout stays clean.
fn setup_logging(verbosity: u8, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
