//! History command: stored samples of a metric.

use anyhow::{Result, bail};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, Time, UtcOffset};
use vitalband_store::SampleQuery;
use vitalband_types::{Metric, parse_day};

use super::Context;
use crate::format::format_samples;

/// Parse a bound as RFC3339, or as a day (`yyyy.MM.dd` / `yyyy-MM-dd`)
/// meaning local midnight in `offset`. Returns epoch milliseconds.
fn parse_bound(s: &str, offset: UtcOffset) -> Result<i64> {
    if let Ok(at) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(millis(at));
    }
    if let Ok(date) = parse_day(s) {
        return Ok(millis(date.with_time(Time::MIDNIGHT).assume_offset(offset)));
    }
    bail!(
        "Invalid time '{}'. Use RFC3339 (e.g. 2024-03-01T22:30:00Z) or a day (2024.03.01)",
        s
    )
}

fn millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Arguments for the history command.
pub struct HistoryArgs {
    pub metric: Metric,
    pub limit: Option<u32>,
    pub since: Option<String>,
    pub until: Option<String>,
}

pub fn cmd_history(args: HistoryArgs, ctx: &Context) -> Result<String> {
    let HistoryArgs {
        metric,
        limit,
        since,
        until,
    } = args;
    let offset = ctx.config.ingest.utc_offset();

    // Parse bounds upfront to fail fast
    let since = since.as_deref().map(|s| parse_bound(s, offset)).transpose()?;
    let until = until.as_deref().map(|s| parse_bound(s, offset)).transpose()?;
    if let (Some(since), Some(until)) = (since, until)
        && since >= until
    {
        bail!("--since must be earlier than --until");
    }

    let default_limit = u32::try_from(ctx.config.ingest.recent_limit).unwrap_or(u32::MAX);
    let mut query = SampleQuery::new(metric).limit(limit.unwrap_or(default_limit));
    if let Some(since) = since {
        query = query.since(since);
    }
    if let Some(until) = until {
        query = query.until(until);
    }

    let store = ctx.open_store()?;
    let samples = store.query(&query)?;
    tracing::debug!(%metric, count = samples.len(), "Queried history");
    format_samples(&samples, metric, &ctx.opts)
}
