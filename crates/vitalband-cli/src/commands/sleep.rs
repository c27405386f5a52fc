//! Sleep command: summary of one night.

use anyhow::{Context as _, Result};
use vitalband_core::sleep::load_summary;

use super::Context;
use crate::format::format_summary;

pub async fn cmd_sleep(day: &str, ctx: &Context) -> Result<String> {
    let store = ctx.open_reactive_store()?;
    let summary = load_summary(&store, day)
        .await
        .with_context(|| format!("Failed to summarize sleep for {day}"))?;
    format_summary(summary.as_ref(), day, &ctx.opts)
}
