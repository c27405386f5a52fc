//! Output formatting for text and JSON.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use vitalband_types::{Metric, SleepSummary, TypedSample};

use crate::cli::OutputFormat;

/// Formatting options for output.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub format: OutputFormat,
    /// Offset wall-clock times are shown in.
    pub offset: UtcOffset,
}

impl FormatOptions {
    pub fn new(format: OutputFormat, offset: UtcOffset) -> Self {
        Self { format, offset }
    }

    pub fn as_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)? + "\n")
    }

    /// Format an epoch-millisecond timestamp as RFC3339 in the display offset.
    pub fn timestamp(&self, millis: i64) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .ok()
            .and_then(|at| at.to_offset(self.offset).format(&Rfc3339).ok())
            .unwrap_or_else(|| format!("{millis} ms"))
    }
}

pub fn format_sample(sample: Option<&TypedSample>, metric: Metric, opts: &FormatOptions) -> Result<String> {
    match opts.format {
        OutputFormat::Json => opts.as_json(&sample),
        OutputFormat::Text => Ok(match sample {
            Some(sample) => format!("{}  {}\n", opts.timestamp(sample.timestamp_millis()), sample),
            None => format!("No {metric} samples stored.\n"),
        }),
    }
}

pub fn format_samples(samples: &[TypedSample], metric: Metric, opts: &FormatOptions) -> Result<String> {
    if opts.format == OutputFormat::Json {
        return opts.as_json(samples);
    }
    if samples.is_empty() {
        return Ok(format!("No {metric} samples stored.\n"));
    }
    let mut out = String::new();
    for sample in samples {
        let _ = writeln!(out, "{}  {}", opts.timestamp(sample.timestamp_millis()), sample);
    }
    Ok(out)
}

fn hours_minutes(minutes: u32) -> String {
    format!("{}h {:02}m", minutes / 60, minutes % 60)
}

pub fn format_summary(summary: Option<&SleepSummary>, day: &str, opts: &FormatOptions) -> Result<String> {
    if opts.format == OutputFormat::Json {
        return opts.as_json(&summary);
    }
    let Some(s) = summary else {
        return Ok(format!("No sleep recorded for {day}.\n"));
    };

    let mut out = String::new();
    let _ = writeln!(out, "Sleep for {}: score {} ({})", s.day, s.score, s.rating);
    let _ = writeln!(
        out,
        "  {} to {}",
        opts.timestamp(s.start_millis),
        opts.timestamp(s.end_millis)
    );
    let _ = writeln!(
        out,
        "  Asleep {} of {} in bed, efficiency {}%",
        hours_minutes(s.total_sleep_minutes),
        hours_minutes(s.in_bed_minutes),
        s.efficiency_percent
    );
    let _ = writeln!(
        out,
        "  Deep  {:>8} {:>3}%",
        hours_minutes(s.deep_minutes),
        s.deep_percent
    );
    let _ = writeln!(
        out,
        "  Light {:>8} {:>3}%",
        hours_minutes(s.light_minutes),
        s.light_percent
    );
    let _ = writeln!(out, "  REM   {:>8} {:>3}%", hours_minutes(s.rem_minutes), s.rem_percent);
    let _ = writeln!(
        out,
        "  Awake {:>8} {:>3}%",
        hours_minutes(s.awake_minutes),
        s.awake_percent
    );
    let _ = writeln!(out, "  Fell asleep after {} min", s.latency_minutes);
    if s.debt_minutes > 0 {
        let _ = writeln!(out, "  Sleep debt {}", hours_minutes(s.debt_minutes));
    }
    if let Some(avg) = average(s.heart_rate.iter().map(|hr| f64::from(hr.bpm))) {
        let _ = writeln!(out, "  Heart rate avg {avg:.0} bpm ({} samples)", s.heart_rate.len());
    }
    if let Some(avg) = average(s.blood_oxygen.iter().map(|o| f64::from(o.percent))) {
        let _ = writeln!(out, "  SpO2 avg {avg:.0}% ({} samples)", s.blood_oxygen.len());
    }
    Ok(out)
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, n), v| (sum + v, n + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Outcome of a replay.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub frames: usize,
    pub persisted: BTreeMap<Metric, usize>,
    pub live_updates: usize,
    pub dropped_frames: usize,
    pub rejected_records: usize,
}

pub fn format_replay(report: &ReplayReport, opts: &FormatOptions) -> Result<String> {
    if opts.format == OutputFormat::Json {
        return opts.as_json(report);
    }
    let mut out = String::new();
    let _ = writeln!(out, "Replayed {} frames.", report.frames);
    for (metric, count) in &report.persisted {
        let _ = writeln!(out, "  {:<15} {count} stored", metric.as_str());
    }
    if report.live_updates > 0 {
        let _ = writeln!(out, "  {} live updates", report.live_updates);
    }
    if report.dropped_frames > 0 {
        let _ = writeln!(out, "  {} frames dropped", report.dropped_frames);
    }
    if report.rejected_records > 0 {
        let _ = writeln!(out, "  {} records rejected", report.rejected_records);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalband_types::HeartRateSample;

    fn text() -> FormatOptions {
        FormatOptions::new(OutputFormat::Text, UtcOffset::UTC)
    }

    fn heart_rate() -> TypedSample {
        HeartRateSample {
            timestamp_millis: 1_709_287_200_000,
            day: "2024.03.01".to_string(),
            bpm: 72,
        }
        .into()
    }

    #[test]
    fn test_timestamp_in_offset() {
        let opts = FormatOptions::new(OutputFormat::Text, UtcOffset::from_hms(2, 0, 0).unwrap());
        assert_eq!(opts.timestamp(1_709_287_200_000), "2024-03-01T12:00:00+02:00");
        assert_eq!(text().timestamp(1_709_287_200_000), "2024-03-01T10:00:00Z");
    }

    #[test]
    fn test_sample_text() {
        let out = format_sample(Some(&heart_rate()), Metric::HeartRate, &text()).unwrap();
        assert_eq!(out, "2024-03-01T10:00:00Z  72 bpm\n");

        let none = format_sample(None, Metric::Steps, &text()).unwrap();
        assert_eq!(none, "No steps samples stored.\n");
    }

    #[test]
    fn test_samples_json_carry_the_metric_tag() {
        let opts = FormatOptions::new(OutputFormat::Json, UtcOffset::UTC);
        let out = format_samples(&[heart_rate()], Metric::HeartRate, &opts).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value[0]["metric"], "heart_rate");
        assert_eq!(value[0]["bpm"], 72);
    }

    #[test]
    fn test_replay_text_omits_empty_counters() {
        let mut report = ReplayReport {
            frames: 3,
            ..Default::default()
        };
        report.persisted.insert(Metric::Sleep, 6);
        let out = format_replay(&report, &text()).unwrap();
        assert!(out.starts_with("Replayed 3 frames."));
        assert!(out.contains("sleep"));
        assert!(!out.contains("dropped"));
    }

    #[test]
    fn test_hours_minutes() {
        assert_eq!(hours_minutes(0), "0h 00m");
        assert_eq!(hours_minutes(485), "8h 05m");
    }
}
