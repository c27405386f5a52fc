//! Config command: inspect and create the configuration file.

use anyhow::{Context as _, Result, bail};
use vitalband_core::SessionConfig;

use super::Context;
use crate::cli::{ConfigAction, OutputFormat};

pub fn cmd_config(action: ConfigAction, ctx: &Context) -> Result<String> {
    match action {
        ConfigAction::Show => match ctx.opts.format {
            OutputFormat::Json => ctx.opts.as_json(&ctx.config),
            OutputFormat::Text => {
                toml::to_string_pretty(&ctx.config).context("Failed to serialize configuration")
            }
        },
        ConfigAction::Path => Ok(format!("{}\n", ctx.config_path.display())),
        ConfigAction::Init { force } => {
            let path = &ctx.config_path;
            if path.exists() && !force {
                bail!(
                    "Config file already exists at {}. Use --force to overwrite.",
                    path.display()
                );
            }
            SessionConfig::default()
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(format!("Wrote default configuration to {}\n", path.display()))
        }
    }
}
