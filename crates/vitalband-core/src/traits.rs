//! Collaborator traits.
//!
//! The core talks to the outside world through two seams:
//!
//! - [`Transport`]: the wireless link (scan, connect, discovery,
//!   notification enablement, writes). [`BleTransport`](crate::ble::BleTransport)
//!   implements it over btleplug and [`MockTransport`](crate::mock::MockTransport)
//!   for tests.
//! - [`SampleStore`]: durable sample storage with reactive feeds.
//!   [`MemoryStore`](crate::mock::MemoryStore) is the in-memory implementation;
//!   the `vitalband-store` crate provides SQLite.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use vitalband_types::{Metric, TypedSample};

use crate::error::Result;
use crate::frame::FramePayload;

/// A stream of values that emits the current result immediately and again
/// after every change.
pub type Feed<T> = BoxStream<'static, T>;

/// A band seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Platform identifier (MAC address, or a UUID on macOS).
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A characteristic in a resolved service layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notify: bool,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Services and characteristics reported after discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceLayout {
    pub services: Vec<ServiceInfo>,
}

impl ServiceLayout {
    /// Find `characteristic` inside `service`.
    pub fn find(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Lifecycle and data events delivered by [`Transport::connect`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connecting,
    LinkUp,
    LinkDown,
    ServicesResolved(ServiceLayout),
    DiscoveryFailed(String),
    /// The band confirmed (or refused) notification enablement.
    NotificationAck { success: bool },
    Notification(FramePayload),
}

/// How a successful enablement registration will be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    /// A [`LinkEvent::NotificationAck`] will follow.
    AwaitAck,
    /// Notifications are already flowing.
    Immediate,
}

/// The wireless transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the platform granted every permission scanning and
    /// connecting need.
    fn has_required_capabilities(&self) -> bool;

    /// Discover nearby bands. The stream ends when scanning stops.
    async fn scan(&self) -> Result<BoxStream<'static, DeviceHandle>>;

    /// Open a link. The stream carries every lifecycle and data event of the
    /// link and ends after the link is torn down.
    async fn connect(&self, device: &DeviceHandle) -> Result<BoxStream<'static, LinkEvent>>;

    /// Ask the platform to discover services. The result arrives as
    /// [`LinkEvent::ServicesResolved`] or [`LinkEvent::DiscoveryFailed`].
    async fn request_discovery(&self) -> Result<()>;

    /// Register for notifications on `characteristic`.
    async fn enable_notifications(&self, service: Uuid, characteristic: Uuid)
    -> Result<Enablement>;

    /// Write bytes to `characteristic`, returning whether the platform accepted them.
    async fn write(&self, characteristic: Uuid, bytes: Bytes) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

/// Durable sample storage.
///
/// Feeds emit the current query result on subscription and again after
/// every write that touches the metric.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert(&self, sample: TypedSample) -> Result<()>;

    /// Insert samples of one metric in a single transaction. Samples sharing
    /// a timestamp replace each other.
    async fn insert_batch(&self, metric: Metric, samples: Vec<TypedSample>) -> Result<usize>;

    /// The newest sample of `metric`.
    fn latest(&self, metric: Metric) -> Feed<Option<TypedSample>>;

    /// Every sample of `metric`, newest first.
    fn history(&self, metric: Metric) -> Feed<Vec<TypedSample>>;

    /// The `limit` newest samples of `metric`, newest first.
    fn recent(&self, metric: Metric, limit: usize) -> Feed<Vec<TypedSample>>;

    /// Samples with `start <= timestamp < end`, oldest first.
    async fn range(&self, metric: Metric, start_millis: i64, end_millis: i64)
    -> Result<Vec<TypedSample>>;

    /// Samples filed under `day` (`yyyy.MM.dd`), oldest first.
    async fn by_day(&self, metric: Metric, day: &str) -> Result<Vec<TypedSample>>;

    async fn clear(&self, metric: Metric) -> Result<()>;
}

/// Build a feed that runs `query` now and again whenever `revisions` changes.
///
/// Bursts of writes between two polls collapse into a single re-query. A
/// failing query is logged and retried on the next revision. The feed ends
/// when the revision sender is dropped.
pub fn revision_feed<T, F, Fut>(revisions: watch::Receiver<u64>, query: F) -> Feed<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    futures::stream::unfold(
        (revisions, query, true),
        |(mut revisions, query, first)| async move {
            if first {
                revisions.mark_unchanged();
            } else {
                revisions.changed().await.ok()?;
            }
            loop {
                match query().await {
                    Ok(value) => return Some((value, (revisions, query, false))),
                    Err(e) => {
                        warn!(error = %e, "Feed query failed");
                        revisions.changed().await.ok()?;
                    }
                }
            }
        },
    )
    .boxed()
}
