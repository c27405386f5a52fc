//! Command-line interface for fitness band telemetry.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `replay` | Push captured frames into the sample database |
//! | `latest` | Newest stored sample of a metric |
//! | `history` | Stored samples of a metric, newest first |
//! | `sleep` | Summary of one night |
//! | `config` | Show, locate or create the configuration file |

mod cli;
mod commands;
mod format;

use std::io::{self, Write};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vitalband_core::{SessionConfig, default_config_path};
use vitalband_store::default_db_path;

use crate::cli::{Cli, Commands, ConfigAction};
use crate::commands::{
    Context, HistoryArgs, cmd_config, cmd_history, cmd_latest, cmd_replay, cmd_sleep,
};
use crate::format::FormatOptions;

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    // `config init` must work even when the existing file is broken.
    if matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Init { .. } | ConfigAction::Path
        }
    ) {
        return Ok(SessionConfig::default());
    }
    let config = match &cli.config {
        Some(path) if path.exists() => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        Some(_) => SessionConfig::default(),
        None => SessionConfig::load_default().context("Failed to load config")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli)?;
    let ctx = Context {
        db_path: cli.db.clone().unwrap_or_else(default_db_path),
        config_path: cli.config.clone().unwrap_or_else(default_config_path),
        opts: FormatOptions::new(cli.format, config.ingest.utc_offset()),
        config,
    };

    let output = match cli.command {
        Commands::Replay { file } => cmd_replay(&file, &ctx).await?,
        Commands::Latest { metric } => cmd_latest(metric, &ctx)?,
        Commands::History {
            metric,
            limit,
            since,
            until,
        } => cmd_history(
            HistoryArgs {
                metric,
                limit,
                since,
                until,
            },
            &ctx,
        )?,
        Commands::Sleep { day } => cmd_sleep(&day, &ctx).await?,
        Commands::Config { action } => cmd_config(action, &ctx)?,
    };

    let mut stdout = io::stdout();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
