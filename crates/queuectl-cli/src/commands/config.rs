//! Config command - show or change settings
//!
//! Usage:
//! ```bash
//! queuectl config show
//! queuectl config set max-retries 5
//! ```

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, Color};
use std::path::Path;

use super::new_table;
use crate::print_success;
use crate::settings::{set_value, Settings};

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings
    #[command(name = "show")]
    Show,

    /// Persist one setting to the settings file
    #[command(name = "set")]
    Set {
        /// Setting name, e.g. max-retries or backoff_base
        key: String,
        value: String,
    },
}

pub fn run(args: ConfigArgs, settings: &Settings, file: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Show => show(settings, file),
        ConfigCommand::Set { key, value } => {
            let updated = set_value(file, settings, &key, &value)?;
            print_success(&format!("Saved to {}", file.display()));
            show(&updated, file)
        }
    }
}

fn show(settings: &Settings, file: &Path) -> Result<()> {
    let mut table = new_table(&["Key", "Value"]);
    for (key, value) in settings.entries()? {
        table.add_row(vec![Cell::new(key).fg(Color::Green), Cell::new(value)]);
    }
    println!("{table}");
    println!("{} {}", "Settings file:".dimmed(), file.display());
    Ok(())
}
