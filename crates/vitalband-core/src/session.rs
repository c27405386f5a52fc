//! The session: one band, one link, one set of feeds.
//!
//! A [`Session`] wires the [`Link`] to the [`Multiplexer`], runs the
//! bring-up choreography every time the link becomes ready to stream and
//! exposes the consumer API: per-metric feeds, link and battery state, spot
//! measurements and history sync. Every outbound command, from bring-up or
//! from a consumer, goes through one [`PacedSink`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use vitalband_core::mock::{MemoryStore, MockCodec, MockTransport};
//! use vitalband_core::{DeviceHandle, Session, SessionConfig};
//! use vitalband_types::Metric;
//!
//! # async fn example() -> vitalband_core::Result<()> {
//! let session = Session::new(
//!     Arc::new(MockTransport::new()),
//!     Arc::new(MockCodec::new()),
//!     Arc::new(MemoryStore::new()),
//!     SessionConfig::default(),
//! )?;
//! session.connect(&DeviceHandle::new("band-1")).await?;
//!
//! let mut heart_rate = session.latest(Metric::HeartRate);
//! while let Some(sample) = heart_rate.next().await {
//!     println!("{sample}");
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vitalband_types::{
    BatteryLevel, DeviceDetails, LinkState, Metric, SleepSummary, SpotMeasurement, TypedSample,
};

use crate::choreography::{Choreographer, CommandSink, PacedSink, RunReport, Step};
use crate::commands::{CommandBuilder, CommandCodec};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::link::Link;
use crate::multiplexer::Multiplexer;
use crate::reconcile::current_value;
use crate::sleep::load_summary;
use crate::traits::{DeviceHandle, Feed, SampleStore, Transport};

/// A session with one band.
///
/// Must be created inside a Tokio runtime. Dropping the session stops its
/// background tasks; [`close`](Self::close) also tears down the link.
pub struct Session {
    link: Arc<Link>,
    sink: Arc<PacedSink>,
    mux: Arc<Multiplexer>,
    choreographer: Choreographer,
    store: Arc<dyn SampleStore>,
    config: SessionConfig,
    events: EventDispatcher,
    cancel: CancellationToken,
    lifecycle: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("mux", &self.mux)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn CommandCodec>,
        store: Arc<dyn SampleStore>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventDispatcher::default();
        let mux = Arc::new(Multiplexer::spawn(
            store.clone(),
            &config.ingest,
            events.clone(),
            config.link.frame_buffer,
        ));
        let frames = mux.sender().ok_or(Error::Cancelled)?;
        let link = Arc::new(Link::new(
            transport,
            config.link.clone(),
            events.clone(),
            frames,
        ));
        let sink = Arc::new(PacedSink::new(
            link.clone(),
            config.choreography.command_gap(),
        ));
        let choreographer = Choreographer::new(
            CommandBuilder::new(codec),
            config.choreography.clone(),
            config.ingest.utc_offset(),
            events.clone(),
        );

        let cancel = CancellationToken::new();
        let lifecycle = tokio::spawn(run_lifecycle(
            sink.clone(),
            mux.clone(),
            choreographer.clone(),
            link.subscribe_transitions(),
            cancel.clone(),
        ));

        Ok(Self {
            link,
            sink,
            mux,
            choreographer,
            store,
            config,
            events,
            cancel,
            lifecycle,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observe what the session is doing.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Scan for bands.
    pub async fn scan(&self) -> Result<BoxStream<'static, DeviceHandle>> {
        self.link.scan().await
    }

    /// Connect to `device`. Bring-up starts on its own once the link is
    /// ready to stream.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<Feed<LinkState>> {
        self.link.connect(device).await
    }

    /// Disconnect and forget the battery level and device details. Safe to
    /// call in any state.
    pub async fn disconnect(&self) -> Result<()> {
        self.link.disconnect().await?;
        self.mux.reset_device_state();
        Ok(())
    }

    /// Stop every background task, tear down the link and end the live feeds.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Disconnect during close failed");
        }
        self.mux.close();
        info!("Session closed");
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// The link state, starting with the current one.
    pub fn connection_state(&self) -> Feed<LinkState> {
        watch_values(self.link.watch_state())
    }

    pub fn current_battery_level(&self) -> BatteryLevel {
        self.mux.battery_level()
    }

    /// The battery level, starting with the current one.
    pub fn battery_level(&self) -> Feed<BatteryLevel> {
        watch_values(self.mux.watch_battery())
    }

    /// Firmware version and MAC address as far as the band has reported them.
    pub fn device_details(&self) -> Feed<DeviceDetails> {
        watch_values(self.mux.watch_details())
    }

    /// The current value of `metric`, merged from live and stored samples.
    pub fn latest(&self, metric: Metric) -> Feed<TypedSample> {
        current_value(
            self.store.latest(metric),
            self.mux.live().feed(metric),
            self.config.ingest.merge_policy,
        )
    }

    /// Every stored sample of `metric`, newest first.
    pub fn history(&self, metric: Metric) -> Feed<Vec<TypedSample>> {
        self.store.history(metric)
    }

    /// The newest stored samples of `metric`, newest first. `limit` defaults
    /// to the configured recent limit.
    pub fn recent_history(&self, metric: Metric, limit: Option<usize>) -> Feed<Vec<TypedSample>> {
        self.store
            .recent(metric, limit.unwrap_or(self.config.ingest.recent_limit))
    }

    /// The night filed under `day`, if any.
    pub async fn sleep_summary(&self, day: &str) -> Result<Option<SleepSummary>> {
        load_summary(self.store.as_ref(), day).await
    }

    /// Start a timed heart-rate or SpO2 measurement.
    ///
    /// Success means the command was written. The reading arrives later as
    /// live telemetry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the link is down, [`Error::Codec`]
    /// when the command cannot be encoded, and [`Error::WriteFailed`] when
    /// the write is rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start_spot_measurement(&self, kind: SpotMeasurement) -> Result<()> {
        self.ensure_connected()?;
        let bytes = self
            .choreographer
            .builder()
            .start_measurement(kind, self.config.choreography.spot_measurement_secs);
        self.write("start_measurement", bytes).await
    }

    /// Ask the band for its battery level. The answer updates
    /// [`battery_level`](Self::battery_level).
    pub async fn refresh_battery_level(&self) -> Result<()> {
        self.ensure_connected()?;
        let bytes = self.choreographer.builder().battery_level();
        self.write("battery_level", bytes).await
    }

    /// Ask the band for its firmware version and MAC address.
    pub async fn request_device_details(&self) -> Result<RunReport> {
        let plan = self.choreographer.device_details_plan();
        self.run_while_connected(plan).await
    }

    /// Request every history category, paced.
    ///
    /// Returns once all requests have been written; the data arrives later
    /// and is persisted as it comes in. A disconnect aborts the remaining
    /// requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the link is down when called or
    /// drops before the sequence ends.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync_historical_data(&self) -> Result<RunReport> {
        let plan = self.choreographer.history_sync_plan();
        let report = self.run_while_connected(plan).await?;
        info!(issued = report.issued, "History sync requested");
        Ok(report)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.link.state().is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn write(&self, command: &str, bytes: bytes::Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::codec(format!("{command} encoded to no bytes")));
        }
        if self.sink.send(bytes).await {
            Ok(())
        } else if self.link.state().is_connected() {
            Err(Error::WriteFailed(format!("{command} write rejected")))
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn run_while_connected(&self, plan: Vec<Step>) -> Result<RunReport> {
        self.ensure_connected()?;
        let cancel = self.cancel.child_token();
        let mut state = self.link.watch_state();
        tokio::select! {
            result = self.choreographer.run(plan, self.sink.as_ref(), &cancel) => result,
            _ = async { state.wait_for(|s| !s.is_connected()).await.is_ok() } => {
                cancel.cancel();
                debug!("Link dropped while running commands");
                Err(Error::NotConnected)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.lifecycle.abort();
    }
}

/// React to link transitions: bring the band up on every StreamingReady and
/// abort it on the next Disconnected.
async fn run_lifecycle(
    sink: Arc<PacedSink>,
    mux: Arc<Multiplexer>,
    choreographer: Choreographer,
    mut transitions: broadcast::Receiver<LinkState>,
    cancel: CancellationToken,
) {
    let mut bring_up: Option<CancellationToken> = None;
    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => break,
            state = transitions.recv() => state,
        };
        match state {
            Ok(LinkState::StreamingReady) => {
                if let Some(previous) = bring_up.take() {
                    previous.cancel();
                }
                let token = cancel.child_token();
                bring_up = Some(token.clone());
                let sink = sink.clone();
                let choreographer = choreographer.clone();
                tokio::spawn(async move {
                    match choreographer.bring_up(sink.as_ref(), &token).await {
                        Ok(_) => {}
                        Err(Error::Cancelled) => debug!("Bring-up aborted"),
                        Err(e) => warn!(error = %e, "Bring-up failed"),
                    }
                });
            }
            Ok(LinkState::Disconnected) => {
                if let Some(token) = bring_up.take() {
                    token.cancel();
                }
                mux.reset_device_state();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Lifecycle fell behind link transitions");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if let Some(token) = bring_up.take() {
        token.cancel();
    }
    debug!("Lifecycle task stopped");
}

fn watch_values<T>(rx: watch::Receiver<T>) -> Feed<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .boxed()
}
