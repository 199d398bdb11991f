//! CLI subcommands

pub mod config;
pub mod dashboard;
pub mod dlq;
pub mod enqueue;
pub mod list;
pub mod metrics;
pub mod status;
pub mod worker;

use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use queuectl_queue::{Job, JobState};
use tokio::signal;
use tracing::{info, warn};

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

pub fn state_color(state: JobState) -> Color {
    match state {
        JobState::Pending => Color::Yellow,
        JobState::Processing => Color::Blue,
        JobState::Completed => Color::Green,
        JobState::Failed => Color::Magenta,
        JobState::Dead => Color::Red,
    }
}

pub fn colored_state(state: JobState) -> ColoredString {
    let text = state.as_str();
    match state {
        JobState::Pending => text.yellow(),
        JobState::Processing => text.blue(),
        JobState::Completed => text.green(),
        JobState::Failed => text.magenta(),
        JobState::Dead => text.red(),
    }
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Cut `text` to at most `max` characters, marking the cut
pub fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}

pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    table
}

/// One row per job
pub fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = new_table(&[
        "ID", "State", "Attempts", "Priority", "Command", "Updated", "Error",
    ]);

    for job in jobs {
        table.add_row(vec![
            Cell::new(&job.id).fg(Color::Green),
            Cell::new(job.state).fg(state_color(job.state)),
            Cell::new(format!("{}/{}", job.attempts, job.max_retries)),
            Cell::new(job.priority),
            Cell::new(truncate(&job.command, 40)),
            Cell::new(format_time(job.updated_at)),
            Cell::new(truncate(job.error.as_deref().unwrap_or("-"), 40)).fg(Color::Red),
        ]);
    }

    table
}
