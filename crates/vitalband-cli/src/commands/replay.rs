//! Replay command: push a capture through the ingest pipeline.
//!
//! Every non-empty line that does not start with `#` is one frame, either
//! JSON text or a `{key=value}` blob. Frames go through the same
//! multiplexer a live session uses, so live telemetry is debounced and
//! collapses to its trailing frame.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use vitalband_core::{EventDispatcher, EventReceiver, FramePayload, Multiplexer, SessionEvent};

use super::Context;
use crate::format::{ReplayReport, format_replay};

fn capture_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

async fn collect(mut events: EventReceiver) -> ReplayReport {
    let mut report = ReplayReport::default();
    loop {
        match events.recv().await {
            Ok(SessionEvent::BatchPersisted { metric, count }) => {
                *report.persisted.entry(metric).or_default() += count;
            }
            Ok(SessionEvent::LiveUpdated { .. }) => report.live_updates += 1,
            Ok(SessionEvent::FrameDropped { .. }) => report.dropped_frames += 1,
            Ok(SessionEvent::RecordsRejected { count, .. }) => report.rejected_records += count,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "Replay report missed events"),
            Err(RecvError::Closed) => break,
        }
    }
    report
}

pub async fn cmd_replay(file: &Path, ctx: &Context) -> Result<String> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read capture {}", file.display()))?;
    let frames = capture_lines(&content);
    let store = ctx.open_reactive_store()?;

    // Live lane sized to the capture so a slow disk never drops live frames.
    let mut ingest = ctx.config.ingest.clone();
    ingest.lane_buffer = ingest.lane_buffer.max(frames.len());

    let events = EventDispatcher::new(ingest.lane_buffer.saturating_mul(4).max(256));
    let collector = tokio::spawn(collect(events.subscribe()));
    let mux = Multiplexer::spawn(Arc::new(store), &ingest, events, ctx.config.link.frame_buffer);

    info!(frames = frames.len(), file = %file.display(), "Replaying capture");
    let mut pushed = 0;
    for frame in frames {
        mux.push(FramePayload::Text(frame))
            .await
            .context("Ingest pipeline stopped")?;
        pushed += 1;
    }
    mux.shutdown().await;

    let mut report = collector.await.context("Replay report task failed")?;
    report.frames = pushed;
    format_replay(&report, &ctx.opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_lines_skip_blanks_and_comments() {
        let lines = capture_lines("# morning sync\n\n  {dataType=28}  \n{\"dataType\": 24}\n");
        assert_eq!(lines, vec!["{dataType=28}", "{\"dataType\": 24}"]);
    }
}
