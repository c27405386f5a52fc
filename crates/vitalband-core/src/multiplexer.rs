//! Inbound frame routing.
//!
//! Every notification the link forwards is decoded, classified by its type
//! code and handed to a lane: one channel and one task per message type.
//! Lanes run independently, so a slow store write for one metric does not
//! hold up frames of another. The live lane is bounded and drops frames when
//! full; every other lane is unbounded and never loses a well-formed frame.
//!
//! | Lane | Handling |
//! |------|----------|
//! | Live telemetry | trailing debounce, then live feeds and the store |
//! | Heart rate, SpO2, blood pressure, temperature history | store, then live feed if newer |
//! | Step and sleep history | store only |
//! | Battery | battery level watch |
//! | Firmware version, MAC address | device details watch |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vitalband_types::{BatteryLevel, DeviceDetails, Metric, TypedSample};

use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::frame::{FramePayload, MessageType, RawFrame, decode_payload};
use crate::normalizer::{Normalizer, fields};
use crate::reconcile::LiveFeeds;
use crate::timestamp::TimestampParser;
use crate::traits::SampleStore;
use crate::value::DecodedValue;

/// Message types that get a lane.
const LANES: [MessageType; 10] = [
    MessageType::LiveTelemetry,
    MessageType::HeartRateHistory,
    MessageType::BloodOxygenHistory,
    MessageType::BloodPressureHistory,
    MessageType::SleepHistory,
    MessageType::StepHistory,
    MessageType::TemperatureHistory,
    MessageType::Battery,
    MessageType::FirmwareVersion,
    MessageType::MacAddress,
];

/// Sending half of a lane.
enum Lane {
    /// Live telemetry: bounded, newest frames dropped when full.
    Lossy(mpsc::Sender<Inbound>),
    Queued(mpsc::UnboundedSender<Inbound>),
}

/// A classified frame and when it reached the multiplexer.
#[derive(Debug)]
struct Inbound {
    frame: RawFrame,
    received_at: OffsetDateTime,
}

/// State shared by the ingest task and the lanes.
struct Pipeline {
    normalizer: Normalizer,
    store: Arc<dyn SampleStore>,
    live: Arc<LiveFeeds>,
    battery: watch::Sender<BatteryLevel>,
    details: watch::Sender<DeviceDetails>,
    events: EventDispatcher,
}

impl Pipeline {
    fn drop_frame(&self, message_type: Option<i64>, reason: impl Into<String>) {
        self.events.send(SessionEvent::FrameDropped {
            message_type,
            reason: reason.into(),
        });
    }

    async fn handle(&self, kind: MessageType, inbound: Inbound) {
        let Some(data) = inbound.frame.data() else {
            warn!(%kind, "Frame without a payload");
            self.drop_frame(Some(kind.code()), "missing payload");
            return;
        };
        match kind {
            MessageType::LiveTelemetry => self.live_snapshot(data, inbound.received_at).await,
            MessageType::Battery => self.battery_frame(data),
            MessageType::FirmwareVersion => self.details_frame(kind, data, fields::FIRMWARE),
            MessageType::MacAddress => self.details_frame(kind, data, fields::MAC),
            other => match other.history_metric() {
                Some(metric) => self.history_batch(metric, data).await,
                None => debug!(kind = %other, "No handler for message type"),
            },
        }
    }

    async fn live_snapshot(&self, data: &DecodedValue, received_at: OffsetDateTime) {
        let snapshot = self.normalizer.live(data, received_at);
        if snapshot.is_empty() {
            debug!("Live frame carried no usable values");
            return;
        }
        for sample in snapshot.into_samples() {
            let metric = sample.metric();
            if self.live.publish(sample.clone()) {
                self.events.send(SessionEvent::LiveUpdated { metric });
            }
            if let Err(e) = self.store.insert(sample).await {
                warn!(%metric, error = %e, "Failed to persist live sample");
            }
        }
    }

    async fn history_batch(&self, metric: Metric, data: &DecodedValue) {
        let batch = self.normalizer.history(metric, data);
        if !batch.rejected.is_empty() {
            for rejection in &batch.rejected {
                warn!(%metric, index = rejection.index, reason = %rejection.reason, "Record rejected");
            }
            self.events.send(SessionEvent::RecordsRejected {
                metric,
                count: batch.rejected.len(),
            });
        }
        if batch.samples.is_empty() {
            debug!(%metric, "History frame produced no samples");
            return;
        }

        let newest = batch
            .samples
            .iter()
            .max_by_key(|s| s.timestamp_millis())
            .cloned();
        match self.store.insert_batch(metric, batch.samples).await {
            Ok(count) => {
                info!(%metric, count, "Persisted history batch");
                self.events.send(SessionEvent::BatchPersisted { metric, count });
            }
            Err(e) => warn!(%metric, error = %e, "Failed to persist history batch"),
        }

        if let Some(newest) = newest.filter(|s| republishes(s))
            && self.live.publish_if_newer(newest)
        {
            self.events.send(SessionEvent::LiveUpdated { metric });
        }
    }

    fn battery_frame(&self, data: &DecodedValue) {
        match Normalizer::battery(data) {
            Ok(level) => {
                debug!(?level, "Battery level updated");
                self.battery.send_replace(level);
                self.events.send(SessionEvent::BatteryUpdated { level });
            }
            Err(e) => {
                warn!(error = %e, "Ignoring battery frame");
                self.drop_frame(Some(MessageType::Battery.code()), e.to_string());
            }
        }
    }

    fn details_frame(&self, kind: MessageType, data: &DecodedValue, keys: &[&str]) {
        let Some(text) = Normalizer::info_text(data, keys) else {
            warn!(%kind, "Informational frame without text");
            self.drop_frame(Some(kind.code()), "missing text");
            return;
        };
        let changed = self.details.send_if_modified(|details| {
            let slot = if kind == MessageType::FirmwareVersion {
                &mut details.firmware_version
            } else {
                &mut details.mac_address
            };
            if slot.as_deref() == Some(text.as_str()) {
                false
            } else {
                *slot = Some(text.clone());
                true
            }
        });
        if changed {
            self.events.send(SessionEvent::DetailsUpdated {
                details: self.details.borrow().clone(),
            });
        }
    }

    fn reset_device_state(&self) {
        self.battery.send_replace(BatteryLevel::Unknown);
        self.details.send_replace(DeviceDetails::default());
    }
}

/// Steps and sleep history are never surfaced as live values.
fn republishes(sample: &TypedSample) -> bool {
    !matches!(sample.metric(), Metric::Steps | Metric::Sleep)
}

/// Routes inbound frames to per-message-type lanes.
///
/// Must be created inside a Tokio runtime. Dropping the multiplexer cancels
/// its ingest task; use [`shutdown`](Self::shutdown) to drain queued frames
/// first.
pub struct Multiplexer {
    pipeline: Arc<Pipeline>,
    frames: Option<mpsc::Sender<FramePayload>>,
    cancel: CancellationToken,
    ingest: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("lanes", &self.lanes.len())
            .field("battery", &*self.pipeline.battery.borrow())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Start the ingest task and one task per lane.
    pub fn spawn(
        store: Arc<dyn SampleStore>,
        config: &IngestConfig,
        events: EventDispatcher,
        frame_buffer: usize,
    ) -> Self {
        let pipeline = Arc::new(Pipeline {
            normalizer: Normalizer::new(TimestampParser::new(config.utc_offset())),
            store,
            live: Arc::new(LiveFeeds::new()),
            battery: watch::channel(BatteryLevel::Unknown).0,
            details: watch::channel(DeviceDetails::default()).0,
            events,
        });

        let mut senders = HashMap::new();
        let mut lanes = Vec::with_capacity(LANES.len());
        for kind in LANES {
            let pipeline = pipeline.clone();
            if kind == MessageType::LiveTelemetry {
                let (tx, rx) = mpsc::channel(config.lane_buffer.max(1));
                senders.insert(kind, Lane::Lossy(tx));
                lanes.push(tokio::spawn(run_debounced_lane(pipeline, rx, config.debounce())));
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.insert(kind, Lane::Queued(tx));
                lanes.push(tokio::spawn(run_lane(pipeline, kind, rx)));
            }
        }

        let (frames_tx, frames_rx) = mpsc::channel(frame_buffer.max(1));
        let cancel = CancellationToken::new();
        let ingest = tokio::spawn(run_ingest(
            pipeline.clone(),
            frames_rx,
            senders,
            cancel.clone(),
        ));

        Self {
            pipeline,
            frames: Some(frames_tx),
            cancel,
            ingest: Some(ingest),
            lanes,
        }
    }

    /// A sender for the link to forward notifications through.
    ///
    /// Returns `None` after [`shutdown`](Self::shutdown) has begun.
    pub fn sender(&self) -> Option<mpsc::Sender<FramePayload>> {
        self.frames.clone()
    }

    /// Feed one frame in as if it had been notified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once the multiplexer has stopped.
    pub async fn push(&self, payload: FramePayload) -> Result<()> {
        let frames = self.frames.as_ref().ok_or(Error::Cancelled)?;
        frames.send(payload).await.map_err(|_| Error::Cancelled)
    }

    pub fn live(&self) -> &Arc<LiveFeeds> {
        &self.pipeline.live
    }

    pub fn battery_level(&self) -> BatteryLevel {
        *self.pipeline.battery.borrow()
    }

    pub fn watch_battery(&self) -> watch::Receiver<BatteryLevel> {
        self.pipeline.battery.subscribe()
    }

    pub fn device_details(&self) -> DeviceDetails {
        self.pipeline.details.borrow().clone()
    }

    pub fn watch_details(&self) -> watch::Receiver<DeviceDetails> {
        self.pipeline.details.subscribe()
    }

    /// Forget the battery level and device details of the last connection.
    pub fn reset_device_state(&self) {
        self.pipeline.reset_device_state();
    }

    /// Stop accepting frames, process everything already queued and wait for
    /// every lane to finish.
    ///
    /// Frames still queued behind other [`sender`](Self::sender) clones are
    /// processed once those clones are dropped.
    pub async fn shutdown(mut self) {
        self.frames.take();
        if let Some(ingest) = self.ingest.take()
            && let Err(e) = ingest.await
        {
            warn!(error = %e, "Ingest task failed");
        }
        for lane in std::mem::take(&mut self.lanes) {
            if let Err(e) = lane.await {
                warn!(error = %e, "Lane task failed");
            }
        }
    }

    /// Stop ingesting immediately. Queued frames already inside a lane are
    /// still processed; the live feeds end.
    pub fn close(&self) {
        self.cancel.cancel();
        self.pipeline.live.close();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_ingest(
    pipeline: Arc<Pipeline>,
    mut frames: mpsc::Receiver<FramePayload>,
    lanes: HashMap<MessageType, Lane>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Ingest cancelled");
                break;
            }
            payload = frames.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let received_at = OffsetDateTime::now_utc();

        let frame = match decode_payload(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                pipeline.drop_frame(None, e.to_string());
                continue;
            }
        };
        let Some(code) = frame.message_type() else {
            warn!("Dropping frame without a message type");
            pipeline.drop_frame(None, "missing message type");
            continue;
        };
        let kind = MessageType::from_code(code);
        let Some(lane) = lanes.get(&kind) else {
            debug!(code, "Dropping frame of unrecognized type");
            pipeline.drop_frame(Some(code), "unrecognized message type");
            continue;
        };

        let inbound = Inbound { frame, received_at };
        let closed = match lane {
            Lane::Lossy(tx) => match tx.try_send(inbound) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%kind, "Lane is full, dropping frame");
                    pipeline.drop_frame(Some(code), "lane full");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            Lane::Queued(tx) => tx.send(inbound).is_err(),
        };
        if closed {
            debug!(%kind, "Lane closed, dropping frame");
            pipeline.drop_frame(Some(code), "lane closed");
        }
    }
    debug!("Ingest stopped");
}

async fn run_lane(
    pipeline: Arc<Pipeline>,
    kind: MessageType,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(inbound) = rx.recv().await {
        pipeline.handle(kind, inbound).await;
    }
    debug!(%kind, "Lane stopped");
}

/// Keep only the last frame of each burst. A frame is handled once `window`
/// passes without a newer one; a pending frame is flushed when the lane closes.
async fn run_debounced_lane(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::Receiver<Inbound>,
    window: Duration,
) {
    let mut pending: Option<(Inbound, Instant)> = None;
    loop {
        let deadline = pending.as_ref().map(|(_, at)| *at);
        tokio::select! {
            inbound = rx.recv() => match inbound {
                Some(inbound) => {
                    if pending.is_some() {
                        debug!("Superseding pending live frame");
                    }
                    pending = Some((inbound, Instant::now() + window));
                }
                None => {
                    if let Some((inbound, _)) = pending.take() {
                        pipeline.handle(MessageType::LiveTelemetry, inbound).await;
                    }
                    break;
                }
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                if let Some((inbound, _)) = pending.take() {
                    pipeline.handle(MessageType::LiveTelemetry, inbound).await;
                }
            }
        }
    }
    debug!("Live lane stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
