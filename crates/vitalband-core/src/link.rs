//! Connection state machine.
//!
//! [`Link`] owns the lifecycle of one wireless link:
//!
//! ```text
//! Disconnected --connect()--> Connecting --link up--> Connected
//!     ^                                                   |
//!     |                  settle delay, discovery, enable notifications
//!     |                                                   v
//!     +------ link down / disconnect() / failure ---- StreamingReady
//! ```
//!
//! A driver task consumes the transport's [`LinkEvent`] stream and is the
//! only writer of the state. Inbound notifications are forwarded, in
//! arrival order, to the frame channel handed to [`Link::new`].
//!
//! If notification enablement succeeds but the band never acknowledges it,
//! the link still becomes StreamingReady once the acknowledgement timeout
//! expires.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vitalband_types::LinkState;

use crate::choreography::CommandSink;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::frame::FramePayload;
use crate::traits::{DeviceHandle, Enablement, Feed, LinkEvent, ServiceLayout, Transport};

/// Characteristics resolved from a service layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    pub notify: Uuid,
    /// Absent when the band exposes no write characteristic; writes then fail.
    pub write: Option<Uuid>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    events: EventDispatcher,
    state: watch::Sender<LinkState>,
    transitions: broadcast::Sender<LinkState>,
    resolved: watch::Sender<Option<ResolvedCharacteristics>>,
    frames: mpsc::Sender<FramePayload>,
}

impl Shared {
    fn set_state(&self, next: LinkState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(from = %previous, to = %next, "Link state changed");
            let _ = self.transitions.send(next);
            self.events.send(SessionEvent::LinkStateChanged {
                from: previous,
                to: next,
            });
        }
    }

    /// Invalidate characteristic handles and fall back to Disconnected.
    fn reset(&self) {
        self.resolved.send_replace(None);
        self.set_state(LinkState::Disconnected);
    }

    fn resolve(&self, layout: &ServiceLayout) -> Result<ResolvedCharacteristics> {
        let service = self.config.service_uuid;
        let notify = layout
            .find(service, self.config.notify_characteristic)
            .filter(|c| c.notify)
            .ok_or_else(|| {
                Error::characteristic_not_found(
                    self.config.notify_characteristic.to_string(),
                    layout.service_count(),
                )
            })?;
        let write = layout
            .find(service, self.config.write_characteristic)
            .map(|c| c.uuid);
        if write.is_none() {
            warn!(
                characteristic = %self.config.write_characteristic,
                "Write characteristic not found; commands will fail"
            );
        }
        Ok(ResolvedCharacteristics {
            notify: notify.uuid,
            write,
        })
    }

    async fn fail(&self, reason: &Error) {
        warn!(error = %reason, "Link setup failed, disconnecting");
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Transport disconnect after failure");
        }
        self.reset();
    }
}

struct Connection {
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// The link connection state machine.
pub struct Link {
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("state", &*self.shared.state.borrow())
            .field("resolved", &*self.shared.resolved.borrow())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Create a link that forwards inbound frames to `frames`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        events: EventDispatcher,
        frames: mpsc::Sender<FramePayload>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (transitions, _) = broadcast::channel(32);
        let (resolved, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                events,
                state,
                transitions,
                resolved,
                frames,
            }),
            connection: Mutex::new(None),
        }
    }

    /// The current state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Replay-1 view of the state.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Every state change from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<LinkState> {
        self.shared.transitions.subscribe()
    }

    pub fn resolved(&self) -> Option<ResolvedCharacteristics> {
        *self.shared.resolved.borrow()
    }

    fn check_capabilities(&self) -> Result<()> {
        if self.shared.transport.has_required_capabilities() {
            Ok(())
        } else {
            warn!("Bluetooth capabilities not granted");
            Err(Error::PermissionDenied)
        }
    }

    /// Scan for bands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] before touching the transport if
    /// the capability check fails.
    pub async fn scan(&self) -> Result<BoxStream<'static, DeviceHandle>> {
        self.check_capabilities()?;
        let events = self.shared.events.clone();
        let devices = self.shared.transport.scan().await?;
        Ok(devices
            .inspect(move |device| {
                debug!(id = %device.id, name = ?device.name, "Device discovered");
                events.send(SessionEvent::DeviceDiscovered {
                    device: device.clone(),
                });
            })
            .boxed())
    }

    /// Connect to `device`, replacing any existing connection.
    ///
    /// Returns the state transitions of this connection, ending with the
    /// next Disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] before touching the transport if
    /// the capability check fails, or the transport's error if it refuses
    /// the connection (the state returns to Disconnected).
    #[tracing::instrument(level = "debug", skip_all, fields(device = %device.id))]
    pub async fn connect(&self, device: &DeviceHandle) -> Result<Feed<LinkState>> {
        self.check_capabilities()?;
        if self.connection.lock().await.is_some() {
            self.disconnect().await?;
        }

        let transitions = transition_feed(self.subscribe_transitions());
        self.shared.set_state(LinkState::Connecting);

        let link_events = match self.shared.transport.connect(device).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Transport connect failed");
                self.shared.reset();
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(self.shared.clone(), link_events, cancel.clone()));
        *self.connection.lock().await = Some(Connection { cancel, driver });
        Ok(transitions)
    }

    /// Tear down the link. Safe to call in any state, any number of times.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.cancel.cancel();
            if let Err(e) = self.shared.transport.disconnect().await {
                warn!(error = %e, "Transport disconnect failed");
            }
            if let Err(e) = connection.driver.await {
                warn!(error = %e, "Link driver task failed");
            }
        }
        self.shared.reset();
        Ok(())
    }

    /// Write `bytes` to the write characteristic.
    ///
    /// Returns false without touching the transport when the bytes are
    /// empty, the link is not at least Connected, or no write characteristic
    /// has been resolved. Writes are never queued.
    pub async fn send(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            debug!("Refusing to send empty command");
            return false;
        }
        if !self.state().is_connected() {
            debug!(state = %self.state(), "Cannot send while not connected");
            return false;
        }
        let Some(characteristic) = self.resolved().and_then(|r| r.write) else {
            debug!("Cannot send without a write characteristic");
            return false;
        };
        self.shared.transport.write(characteristic, bytes).await
    }
}

#[async_trait]
impl CommandSink for Link {
    async fn send(&self, bytes: Bytes) -> bool {
        Link::send(self, bytes).await
    }
}

fn transition_feed(rx: broadcast::Receiver<LinkState>) -> Feed<LinkState> {
    futures::stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(LinkState::Disconnected) => return Some((LinkState::Disconnected, None)),
                Ok(state) => return Some((state, Some(rx))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Transition feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut link_events: BoxStream<'static, LinkEvent>,
    cancel: CancellationToken,
) {
    let mut settle_deadline: Option<Instant> = None;
    let mut ack_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Link driver cancelled");
                return;
            }
            _ = wait_until(settle_deadline) => {
                settle_deadline = None;
                debug!("Requesting service discovery");
                if let Err(e) = shared.transport.request_discovery().await {
                    shared.fail(&e).await;
                    return;
                }
            }
            _ = wait_until(ack_deadline) => {
                ack_deadline = None;
                if *shared.state.borrow() == LinkState::Connected {
                    warn!(
                        timeout = ?shared.config.ack_timeout(),
                        "Notification acknowledgement not received, assuming streaming"
                    );
                    shared.set_state(LinkState::StreamingReady);
                }
            }
            event = link_events.next() => {
                let Some(event) = event else {
                    debug!("Link event stream ended");
                    shared.reset();
                    return;
                };
                match event {
                    LinkEvent::Connecting => shared.set_state(LinkState::Connecting),
                    LinkEvent::LinkUp => {
                        shared.set_state(LinkState::Connected);
                        settle_deadline = Some(Instant::now() + shared.config.settle_delay());
                    }
                    LinkEvent::ServicesResolved(layout) => {
                        let resolved = match shared.resolve(&layout) {
                            Ok(resolved) => resolved,
                            Err(e) => {
                                shared.fail(&e).await;
                                return;
                            }
                        };
                        debug!(?resolved, "Characteristics resolved");
                        shared.resolved.send_replace(Some(resolved));
                        match shared
                            .transport
                            .enable_notifications(shared.config.service_uuid, resolved.notify)
                            .await
                        {
                            Ok(Enablement::AwaitAck) => {
                                ack_deadline = Some(Instant::now() + shared.config.ack_timeout());
                            }
                            Ok(Enablement::Immediate) => shared.set_state(LinkState::StreamingReady),
                            Err(e) => {
                                shared.fail(&e).await;
                                return;
                            }
                        }
                    }
                    LinkEvent::DiscoveryFailed(reason) => {
                        shared.fail(&Error::transport("discovery", reason)).await;
                        return;
                    }
                    LinkEvent::NotificationAck { success } => {
                        ack_deadline = None;
                        if !success {
                            warn!("Band refused notification enablement, continuing anyway");
                        }
                        if *shared.state.borrow() == LinkState::Connected {
                            shared.set_state(LinkState::StreamingReady);
                        }
                    }
                    LinkEvent::Notification(payload) => {
                        if shared.frames.send(payload).await.is_err() {
                            debug!("Frame receiver closed, dropping notification");
                        }
                    }
                    LinkEvent::LinkDown => {
                        info!("Link down");
                        shared.reset();
                        return;
                    }
                }
            }
        }
    }
}
