//! Latest command: newest stored sample of a metric.

use anyhow::Result;
use vitalband_types::Metric;

use super::Context;
use crate::format::format_sample;

pub fn cmd_latest(metric: Metric, ctx: &Context) -> Result<String> {
    let store = ctx.open_store()?;
    let sample = store.latest(metric)?;
    format_sample(sample.as_ref(), metric, &ctx.opts)
}
