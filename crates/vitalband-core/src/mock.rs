//! Test doubles for the collaborator traits.
//!
//! These let the whole session run without Bluetooth hardware, a real
//! codec or a database.
//!
//! - [`MockTransport`]: scripted link events, recorded writes with their
//!   instants, a capability toggle and failure injection
//! - [`MockCodec`]: encodes each command as its name, with per-command
//!   failure injection
//! - [`MemoryStore`]: an in-memory reactive [`SampleStore`]
//!
//! Write instants use [`tokio::time::Instant`], so tests running with a
//! paused clock can assert exact pacing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use vitalband_types::uuids::{BAND_SERVICE, NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};
use vitalband_types::{Metric, TypedSample};

use crate::commands::{Command, CommandCodec};
use crate::error::{Error, Result};
use crate::frame::FramePayload;
use crate::traits::{
    CharacteristicInfo, DeviceHandle, Enablement, Feed, LinkEvent, SampleStore, ServiceInfo,
    ServiceLayout, Transport, revision_feed,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How [`MockTransport`] answers notification enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockAck {
    /// Register, then acknowledge successfully.
    #[default]
    Auto,
    /// Register, then acknowledge with a failure.
    Refused,
    /// Register and never acknowledge.
    Never,
    /// Report notifications as already flowing.
    Immediate,
    /// Fail the registration.
    Fail,
}

/// A write recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub characteristic: Uuid,
    pub bytes: Bytes,
    pub at: Instant,
}

/// The layout of a healthy band.
pub fn band_layout() -> ServiceLayout {
    ServiceLayout {
        services: vec![ServiceInfo {
            uuid: BAND_SERVICE,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: WRITE_CHARACTERISTIC,
                    notify: false,
                    write: true,
                },
                CharacteristicInfo {
                    uuid: NOTIFY_CHARACTERISTIC,
                    notify: true,
                    write: false,
                },
            ],
        }],
    }
}

/// A scriptable [`Transport`].
///
/// By default `connect` emits `Connecting` and `LinkUp`, discovery answers
/// with [`band_layout`], enablement is acknowledged, and writes succeed.
pub struct MockTransport {
    capabilities: AtomicBool,
    fail_connect: AtomicBool,
    accept_writes: AtomicBool,
    ack: Mutex<MockAck>,
    layout: Mutex<Option<ServiceLayout>>,
    devices: Mutex<Vec<DeviceHandle>>,
    link: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    writes: Mutex<Vec<RecordedWrite>>,
    discovery_requests: Mutex<Vec<Instant>>,
    scan_count: AtomicU32,
    connect_count: AtomicU32,
    enable_count: AtomicU32,
    disconnect_count: AtomicU32,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("capabilities", &self.capabilities.load(Ordering::Relaxed))
            .field("ack", &*lock(&self.ack))
            .field("writes", &lock(&self.writes).len())
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            capabilities: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            accept_writes: AtomicBool::new(true),
            ack: Mutex::new(MockAck::Auto),
            layout: Mutex::new(Some(band_layout())),
            devices: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            discovery_requests: Mutex::new(Vec::new()),
            scan_count: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
            enable_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
        }
    }

    // --- Test control methods ---

    pub fn set_capabilities(&self, granted: bool) {
        self.capabilities.store(granted, Ordering::Relaxed);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    pub fn set_accept_writes(&self, accept: bool) {
        self.accept_writes.store(accept, Ordering::Relaxed);
    }

    pub fn set_ack(&self, ack: MockAck) {
        *lock(&self.ack) = ack;
    }

    /// Layout reported after discovery.
    pub fn set_layout(&self, layout: ServiceLayout) {
        *lock(&self.layout) = Some(layout);
    }

    /// Leave discovery requests unanswered.
    pub fn clear_layout(&self) {
        *lock(&self.layout) = None;
    }

    pub fn add_device(&self, device: DeviceHandle) {
        lock(&self.devices).push(device);
    }

    /// Push an event onto the open link. Returns false if no link is open.
    pub fn emit(&self, event: LinkEvent) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Deliver an inbound notification.
    pub fn notify(&self, payload: FramePayload) -> bool {
        self.emit(LinkEvent::Notification(payload))
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.writes).clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.writes).clear();
    }

    /// Payloads written, decoded as UTF-8 (the [`MockCodec`] encoding).
    pub fn written_commands(&self) -> Vec<String> {
        lock(&self.writes)
            .iter()
            .map(|w| String::from_utf8_lossy(&w.bytes).into_owned())
            .collect()
    }

    pub fn discovery_requests(&self) -> Vec<Instant> {
        lock(&self.discovery_requests).clone()
    }

    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn enable_count(&self) -> u32 {
        self.enable_count.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn has_required_capabilities(&self) -> bool {
        self.capabilities.load(Ordering::Relaxed)
    }

    async fn scan(&self) -> Result<BoxStream<'static, DeviceHandle>> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
        let devices = lock(&self.devices).clone();
        Ok(futures::stream::iter(devices).boxed())
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<BoxStream<'static, LinkEvent>> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::transport("connect", format!("{} refused", device.id)));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(LinkEvent::Connecting);
        let _ = tx.send(LinkEvent::LinkUp);
        *lock(&self.link) = Some(tx);
        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn request_discovery(&self) -> Result<()> {
        lock(&self.discovery_requests).push(Instant::now());
        let layout = lock(&self.layout).clone();
        if let Some(layout) = layout {
            self.emit(LinkEvent::ServicesResolved(layout));
        }
        Ok(())
    }

    async fn enable_notifications(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Enablement> {
        self.enable_count.fetch_add(1, Ordering::Relaxed);
        let ack = *lock(&self.ack);
        match ack {
            MockAck::Auto => {
                self.emit(LinkEvent::NotificationAck { success: true });
                Ok(Enablement::AwaitAck)
            }
            MockAck::Refused => {
                self.emit(LinkEvent::NotificationAck { success: false });
                Ok(Enablement::AwaitAck)
            }
            MockAck::Never => Ok(Enablement::AwaitAck),
            MockAck::Immediate => Ok(Enablement::Immediate),
            MockAck::Fail => Err(Error::transport("enable notifications", "mock failure")),
        }
    }

    async fn write(&self, characteristic: Uuid, bytes: Bytes) -> bool {
        if !self.accept_writes.load(Ordering::Relaxed) {
            return false;
        }
        lock(&self.writes).push(RecordedWrite {
            characteristic,
            bytes,
            at: Instant::now(),
        });
        true
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.link).take();
        Ok(())
    }
}

/// A [`CommandCodec`] that encodes each command as its name.
///
/// Inbound bytes decode as UTF-8 text payloads.
#[derive(Debug, Default)]
pub struct MockCodec {
    failing: Mutex<HashSet<String>>,
    encoded: Mutex<Vec<Command>>,
}

impl MockCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make encoding of the named command fail.
    pub fn fail_command(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Every command encoded so far, failed ones included.
    pub fn encoded(&self) -> Vec<Command> {
        lock(&self.encoded).clone()
    }
}

impl CommandCodec for MockCodec {
    fn encode(&self, command: &Command) -> Result<Bytes> {
        lock(&self.encoded).push(command.clone());
        if lock(&self.failing).contains(command.name()) {
            return Err(Error::codec(format!("cannot encode {}", command.name())));
        }
        Ok(Bytes::from_static(command.name().as_bytes()))
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<FramePayload> {
        std::str::from_utf8(bytes)
            .map(|text| FramePayload::Text(text.to_string()))
            .map_err(|e| Error::codec(format!("frame is not UTF-8: {e}")))
    }
}

#[derive(Debug)]
struct MemoryInner {
    samples: Mutex<HashMap<Metric, BTreeMap<i64, TypedSample>>>,
    revisions: HashMap<Metric, watch::Sender<u64>>,
    fail_writes: AtomicBool,
    write_count: AtomicU32,
}

impl MemoryInner {
    fn bump(&self, metric: Metric) {
        if let Some(tx) = self.revisions.get(&metric) {
            tx.send_modify(|rev| *rev += 1);
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            Err(Error::storage("mock write failure"))
        } else {
            Ok(())
        }
    }

    fn newest_first(&self, metric: Metric, limit: Option<usize>) -> Vec<TypedSample> {
        lock(&self.samples).get(&metric).map_or_else(Vec::new, |rows| {
            rows.values()
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }

    fn oldest_first(&self, metric: Metric, keep: impl Fn(&TypedSample) -> bool) -> Vec<TypedSample> {
        lock(&self.samples).get(&metric).map_or_else(Vec::new, |rows| {
            rows.values().filter(|s| keep(s)).cloned().collect()
        })
    }
}

/// An in-memory [`SampleStore`].
///
/// Samples are keyed by metric and timestamp; inserting a sample with an
/// existing timestamp replaces it.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                samples: Mutex::new(HashMap::new()),
                revisions: Metric::ALL
                    .into_iter()
                    .map(|metric| (metric, watch::channel(0).0))
                    .collect(),
                fail_writes: AtomicBool::new(false),
                write_count: AtomicU32::new(0),
            }),
        }
    }

    /// Make every write fail with [`Error::Storage`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of successful write calls (single or batch).
    pub fn write_count(&self) -> u32 {
        self.inner.write_count.load(Ordering::Relaxed)
    }

    /// Number of stored samples of `metric`.
    pub fn count(&self, metric: Metric) -> usize {
        lock(&self.inner.samples).get(&metric).map_or(0, BTreeMap::len)
    }

    fn feed<T, F>(&self, metric: Metric, query: F) -> Feed<T>
    where
        T: Send + 'static,
        F: Fn(&MemoryInner) -> T + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let query = Arc::new(query);
        let Some(revisions) = self.inner.revisions.get(&metric).map(watch::Sender::subscribe)
        else {
            return futures::stream::empty().boxed();
        };
        revision_feed(revisions, move || {
            let inner = inner.clone();
            let query = query.clone();
            async move { Ok(query(&inner)) }
        })
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn insert(&self, sample: TypedSample) -> Result<()> {
        self.inner.check_writable()?;
        let metric = sample.metric();
        lock(&self.inner.samples)
            .entry(metric)
            .or_default()
            .insert(sample.timestamp_millis(), sample);
        self.inner.write_count.fetch_add(1, Ordering::Relaxed);
        self.inner.bump(metric);
        Ok(())
    }

    async fn insert_batch(&self, metric: Metric, samples: Vec<TypedSample>) -> Result<usize> {
        self.inner.check_writable()?;
        if let Some(other) = samples.iter().find(|s| s.metric() != metric) {
            return Err(Error::storage(format!(
                "{} sample in a {} batch",
                other.metric(),
                metric
            )));
        }
        let count = samples.len();
        {
            let mut all = lock(&self.inner.samples);
            let rows = all.entry(metric).or_default();
            for sample in samples {
                rows.insert(sample.timestamp_millis(), sample);
            }
        }
        self.inner.write_count.fetch_add(1, Ordering::Relaxed);
        self.inner.bump(metric);
        Ok(count)
    }

    fn latest(&self, metric: Metric) -> Feed<Option<TypedSample>> {
        self.feed(metric, move |inner| {
            inner.newest_first(metric, Some(1)).into_iter().next()
        })
    }

    fn history(&self, metric: Metric) -> Feed<Vec<TypedSample>> {
        self.feed(metric, move |inner| inner.newest_first(metric, None))
    }

    fn recent(&self, metric: Metric, limit: usize) -> Feed<Vec<TypedSample>> {
        self.feed(metric, move |inner| inner.newest_first(metric, Some(limit)))
    }

    async fn range(
        &self,
        metric: Metric,
        start_millis: i64,
        end_millis: i64,
    ) -> Result<Vec<TypedSample>> {
        Ok(self.inner.oldest_first(metric, |s| {
            (start_millis..end_millis).contains(&s.timestamp_millis())
        }))
    }

    async fn by_day(&self, metric: Metric, day: &str) -> Result<Vec<TypedSample>> {
        Ok(self.inner.oldest_first(metric, |s| s.day() == day))
    }

    async fn clear(&self, metric: Metric) -> Result<()> {
        lock(&self.inner.samples).remove(&metric);
        self.inner.bump(metric);
        Ok(())
    }
}
