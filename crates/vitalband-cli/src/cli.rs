//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vitalband_types::Metric;

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "vitalband")]
#[command(author, version, about = "CLI for fitness band telemetry", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Sample database (defaults to the platform data directory)
    #[arg(long, global = true, env = "VITALBAND_DB")]
    pub db: Option<PathBuf>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "VITALBAND_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push captured frames through the ingest pipeline into the database
    Replay {
        /// Capture file: one frame per line, JSON or `{key=value}` text
        file: PathBuf,
    },

    /// Show the newest stored sample of a metric
    Latest {
        #[arg(value_parser = parse_metric)]
        metric: Metric,
    },

    /// List stored samples of a metric, newest first
    History {
        #[arg(value_parser = parse_metric)]
        metric: Metric,

        /// Maximum number of samples (defaults to the configured recent limit)
        #[arg(short, long)]
        limit: Option<u32>,

        /// Only samples at or after this time (RFC3339 or a day)
        #[arg(long)]
        since: Option<String>,

        /// Only samples before this time (RFC3339 or a day)
        #[arg(long)]
        until: Option<String>,
    },

    /// Summarize the night filed under a day
    Sleep {
        /// Day as yyyy.MM.dd or yyyy-MM-dd
        day: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_metric(s: &str) -> Result<Metric, String> {
    s.parse().map_err(|e: vitalband_types::ParseError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_history_arguments() {
        let cli = Cli::try_parse_from([
            "vitalband", "--format", "json", "history", "spo2", "--limit", "5", "--since",
            "2024-03-01",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::History {
                metric,
                limit,
                since,
                until,
            } => {
                assert_eq!(metric, Metric::BloodOxygen);
                assert_eq!(limit, Some(5));
                assert_eq!(since.as_deref(), Some("2024-03-01"));
                assert_eq!(until, None);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_unknown_metric_is_rejected() {
        assert!(Cli::try_parse_from(["vitalband", "latest", "glucose"]).is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["vitalband", "-v", "-q", "config", "show"]).is_err());
    }
}
