//! Paced command sequences.
//!
//! The band drops commands that arrive back to back, so multi-command
//! sequences are issued as a plan of [`Step`]s, each followed by a fixed
//! pause. Writes are fire-and-forget: nothing waits for the band's answer,
//! which arrives later as an inbound frame.
//!
//! | Sequence | Steps |
//! |----------|-------|
//! | Bring-up | set time, 500 ms, battery, 500 ms, enable live stream, 2000 ms, history sync |
//! | History sync | heart rate, SpO2, HRV, sleep, steps, temperature, 1 s apart |
//!
//! Plans and one-off consumer commands can run at the same time. A
//! [`PacedSink`] sits in front of the link and keeps any two writes at least
//! the command gap apart, whoever issues them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{Command, CommandBuilder, HistoryCategory, HistoryCursor};
use crate::config::ChoreographyConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};

/// Something commands can be written to.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Write `bytes`, returning whether the write was accepted.
    async fn send(&self, bytes: Bytes) -> bool;
}

/// Serializes writes to `inner` and spaces them at least `gap` apart.
pub struct PacedSink {
    inner: Arc<dyn CommandSink>,
    gap: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for PacedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacedSink")
            .field("gap", &self.gap)
            .finish_non_exhaustive()
    }
}

impl PacedSink {
    pub fn new(inner: Arc<dyn CommandSink>, gap: Duration) -> Self {
        Self {
            inner,
            gap,
            last_write: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CommandSink for PacedSink {
    async fn send(&self, bytes: Bytes) -> bool {
        let mut last_write = self.last_write.lock().await;
        if let Some(ready) = (*last_write).map(|at| at + self.gap)
            && Instant::now() < ready
        {
            debug!(wait = ?ready.duration_since(Instant::now()), "Holding command for pacing");
            tokio::time::sleep_until(ready).await;
        }
        let accepted = self.inner.send(bytes).await;
        *last_write = Some(Instant::now());
        accepted
    }
}

/// One command and the pause that must follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub command: Command,
    pub pause_after: Duration,
}

impl Step {
    pub fn new(command: Command, pause_after: Duration) -> Self {
        Self {
            command,
            pause_after,
        }
    }
}

/// Outcome of running a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Commands written successfully.
    pub issued: usize,
    /// Commands skipped because the codec produced no bytes.
    pub skipped: usize,
    /// Commands whose write was rejected.
    pub failed: usize,
}

/// Builds and runs paced command plans.
#[derive(Debug, Clone)]
pub struct Choreographer {
    builder: CommandBuilder,
    config: ChoreographyConfig,
    offset: UtcOffset,
    events: EventDispatcher,
}

impl Choreographer {
    pub fn new(
        builder: CommandBuilder,
        config: ChoreographyConfig,
        offset: UtcOffset,
        events: EventDispatcher,
    ) -> Self {
        Self {
            builder,
            config,
            offset,
            events,
        }
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub fn config(&self) -> &ChoreographyConfig {
        &self.config
    }

    /// The plan issued when the link becomes ready to stream.
    pub fn bring_up_plan(&self, now: OffsetDateTime) -> Vec<Step> {
        let gap = self.config.command_gap();
        let mut plan = vec![
            Step::new(Command::SetDeviceTime(now.to_offset(self.offset)), gap),
            Step::new(Command::BatteryLevel, gap),
            Step::new(
                Command::EnableRealtime {
                    steps: true,
                    temperature: self.config.realtime_temperature,
                },
                self.config.streaming_settle(),
            ),
        ];
        plan.extend(self.history_sync_plan());
        plan
    }

    /// One start-mode history request per category, paced, with no pause
    /// after the last.
    pub fn history_sync_plan(&self) -> Vec<Step> {
        let pacing = self.config.history_pacing();
        let last = HistoryCategory::SYNC_ORDER.len() - 1;
        HistoryCategory::SYNC_ORDER
            .iter()
            .enumerate()
            .map(|(i, category)| {
                Step::new(
                    Command::History {
                        category: *category,
                        cursor: HistoryCursor::start(),
                    },
                    if i == last { Duration::ZERO } else { pacing },
                )
            })
            .collect()
    }

    /// Version and MAC queries, paced like the bring-up.
    pub fn device_details_plan(&self) -> Vec<Step> {
        vec![
            Step::new(Command::FirmwareVersion, self.config.command_gap()),
            Step::new(Command::MacAddress, Duration::ZERO),
        ]
    }

    /// Run `plan` against `sink`.
    ///
    /// Commands the codec cannot encode are skipped; their pause is still
    /// observed. Cancelling `cancel` aborts the remaining steps and pauses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires before the plan ends.
    #[tracing::instrument(level = "debug", skip_all, fields(steps = plan.len()))]
    pub async fn run(
        &self,
        plan: Vec<Step>,
        sink: &dyn CommandSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        for step in plan {
            if cancel.is_cancelled() {
                debug!("Choreography cancelled");
                return Err(Error::Cancelled);
            }
            let name = step.command.name();
            let bytes = self.builder.build(&step.command);
            if bytes.is_empty() {
                debug!(command = name, "Skipping command with no bytes");
                report.skipped += 1;
                self.events.send(SessionEvent::CommandSkipped {
                    command: name.to_string(),
                });
            } else if sink.send(bytes).await {
                debug!(command = name, "Command issued");
                report.issued += 1;
                self.events.send(SessionEvent::CommandIssued {
                    command: name.to_string(),
                });
            } else {
                warn!(command = name, "Command write rejected");
                report.failed += 1;
                self.events.send(SessionEvent::CommandSkipped {
                    command: name.to_string(),
                });
            }

            if !step.pause_after.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(command = name, "Choreography cancelled during pause");
                        return Err(Error::Cancelled);
                    }
                    _ = tokio::time::sleep(step.pause_after) => {}
                }
            }
        }
        Ok(report)
    }

    /// Run the bring-up sequence.
    pub async fn bring_up(
        &self,
        sink: &dyn CommandSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        info!("Starting device bring-up");
        let report = self
            .run(self.bring_up_plan(OffsetDateTime::now_utc()), sink, cancel)
            .await?;
        info!(
            issued = report.issued,
            skipped = report.skipped,
            failed = report.failed,
            "Device bring-up finished"
        );
        Ok(report)
    }

    /// Run the historical sync sequence.
    pub async fn sync_history(
        &self,
        sink: &dyn CommandSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.run(self.history_sync_plan(), sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::mock::MockCodec;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(Bytes, Instant)>>,
        accept: bool,
    }

    impl RecordingSink {
        fn accepting() -> Self {
            Self {
                accept: true,
                ..Default::default()
            }
        }

        fn names(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(b, _)| String::from_utf8_lossy(b).into_owned())
                .collect()
        }

        fn offsets_ms(&self, start: Instant) -> Vec<u128> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, at)| at.duration_since(start).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send(&self, bytes: Bytes) -> bool {
            self.writes.lock().unwrap().push((bytes, Instant::now()));
            self.accept
        }
    }

    fn choreographer(codec: Arc<MockCodec>) -> Choreographer {
        Choreographer::new(
            CommandBuilder::new(codec),
            ChoreographyConfig::default(),
            UtcOffset::UTC,
            EventDispatcher::default(),
        )
    }

    #[test]
    fn test_bring_up_plan_order() {
        let plan = choreographer(Arc::new(MockCodec::new()))
            .bring_up_plan(OffsetDateTime::UNIX_EPOCH);
        let names: Vec<_> = plan.iter().map(|s| s.command.name()).collect();
        assert_eq!(
            names,
            vec![
                "set_device_time",
                "battery_level",
                "enable_realtime",
                "history_heart_rate",
                "history_blood_oxygen",
                "history_hrv",
                "history_sleep",
                "history_total_steps",
                "history_temperature",
            ]
        );
        assert_eq!(plan.last().unwrap().pause_after, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_timing() {
        let choreographer = choreographer(Arc::new(MockCodec::new()));
        let sink = RecordingSink::accepting();
        let start = Instant::now();

        let report = choreographer
            .bring_up(&sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.issued, 9);
        assert_eq!(
            sink.offsets_ms(start),
            vec![0, 500, 1_000, 3_000, 4_000, 5_000, 6_000, 7_000, 8_000]
        );
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bytes_are_skipped_but_pacing_kept() {
        let codec = Arc::new(MockCodec::new());
        codec.fail_command("battery_level");
        let choreographer = choreographer(codec);
        let sink = RecordingSink::accepting();
        let start = Instant::now();

        let report = choreographer
            .bring_up(&sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.issued, 8);
        assert!(!sink.names().contains(&"battery_level".to_string()));
        assert_eq!(sink.offsets_ms(start)[1], 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_remaining_steps() {
        let choreographer = choreographer(Arc::new(MockCodec::new()));
        let sink = Arc::new(RecordingSink::accepting());
        let cancel = CancellationToken::new();

        let task = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { choreographer.bring_up(sink.as_ref(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        cancel.cancel();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(
            sink.names(),
            vec!["set_device_time", "battery_level", "enable_realtime"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_sink_spaces_concurrent_writers() {
        let recording = Arc::new(RecordingSink::accepting());
        let sink = Arc::new(PacedSink::new(recording.clone(), Duration::from_millis(500)));
        let start = Instant::now();

        let writers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.send(Bytes::from_static(name.as_bytes())).await })
            })
            .collect();
        for writer in writers {
            assert!(writer.await.unwrap());
        }

        assert_eq!(recording.offsets_ms(start), vec![0, 500, 1_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_sink_does_not_delay_spaced_writes() {
        let recording = Arc::new(RecordingSink::accepting());
        let sink = PacedSink::new(recording.clone(), Duration::from_millis(500));
        let start = Instant::now();

        sink.send(Bytes::from_static(b"a")).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        sink.send(Bytes::from_static(b"b")).await;

        assert_eq!(recording.offsets_ms(start), vec![0, 700]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_writes_are_counted() {
        let choreographer = choreographer(Arc::new(MockCodec::new()));
        let sink = RecordingSink::default();
        let report = choreographer
            .sync_history(&sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 6);
        assert_eq!(report.issued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_emitted() {
        let events = EventDispatcher::default();
        let mut rx = events.subscribe();
        let choreographer = Choreographer::new(
            CommandBuilder::new(Arc::new(MockCodec::new())),
            ChoreographyConfig::default(),
            UtcOffset::UTC,
            events,
        );
        choreographer
            .run(
                choreographer.device_details_plan(),
                &RecordingSink::accepting(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::CommandIssued {
                command: "firmware_version".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::CommandIssued {
                command: "mac_address".to_string()
            }
        );
    }
}
