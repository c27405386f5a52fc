//! [`Transport`] over the platform Bluetooth stack via `btleplug`.
//!
//! # Platform Differences
//!
//! Devices are identified by a CoreBluetooth UUID on macOS and by their
//! Bluetooth address elsewhere. [`DeviceHandle::id`] carries whichever the
//! platform provides, so a handle is only meaningful on the machine that
//! scanned it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::CommandCodec;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};
use crate::traits::{
    CharacteristicInfo, DeviceHandle, Enablement, LinkEvent, ServiceInfo, ServiceLayout, Transport,
};

/// Timeouts and scan settings for [`BleTransport`].
#[derive(Debug, Clone)]
pub struct BleOptions {
    /// Only peripherals advertising this service are reported by scans.
    pub service: Uuid,
    pub scan_duration: Duration,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_retry: RetryConfig,
}

impl Default for BleOptions {
    fn default() -> Self {
        Self {
            service: vitalband_types::uuids::BAND_SERVICE,
            scan_duration: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            connect_retry: RetryConfig::for_connect(),
        }
    }
}

/// Format a peripheral ID as a plain string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{id:?}")
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// The address, or the peripheral ID where the platform hides addresses.
fn identifier(address: &str, id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(id)
    } else {
        address.to_string()
    }
}

struct ActiveLink {
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<LinkEvent>,
    characteristics: Arc<StdMutex<HashMap<Uuid, Characteristic>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics
            .lock()
            .ok()
            .and_then(|cache| cache.get(&uuid).cloned())
    }
}

/// The `btleplug` transport. Holds at most one active link.
pub struct BleTransport {
    adapter: Adapter,
    codec: Arc<dyn CommandCodec>,
    options: BleOptions,
    active: Mutex<Option<ActiveLink>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Use the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the machine has no adapter.
    pub async fn new(codec: Arc<dyn CommandCodec>, options: BleOptions) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::device_not_found("Bluetooth adapter"))?;
        Ok(Self::with_adapter(adapter, codec, options))
    }

    pub fn with_adapter(adapter: Adapter, codec: Arc<dyn CommandCodec>, options: BleOptions) -> Self {
        Self {
            adapter,
            codec,
            options,
            active: Mutex::new(None),
        }
    }

    async fn handle_for(&self, peripheral: &Peripheral) -> Result<Option<DeviceHandle>> {
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };
        if !properties.services.contains(&self.options.service) {
            return Ok(None);
        }
        let id = identifier(&properties.address.to_string(), &peripheral.id());
        Ok(Some(DeviceHandle {
            id,
            name: properties.local_name,
            rssi: properties.rssi,
        }))
    }

    async fn find_peripheral(&self, device: &DeviceHandle) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if identifier(&properties.address.to_string(), &peripheral.id()) == device.id {
                return Ok(peripheral);
            }
        }
        Err(Error::device_not_found(&device.id))
    }

    async fn scan_once(&self) -> Result<Vec<DeviceHandle>> {
        info!(duration = ?self.options.scan_duration, "Starting BLE scan");
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.options.service],
            })
            .await?;
        sleep(self.options.scan_duration).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            match self.handle_for(&peripheral).await {
                Ok(Some(handle)) => found.push(handle),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Skipping peripheral"),
            }
        }
        info!(count = found.len(), "Scan complete");
        Ok(found)
    }
}

/// Forward link-down events for `id` from the adapter.
fn watch_link_down(
    adapter: Adapter,
    id: PeripheralId,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut central = match adapter.events().await {
            Ok(central) => central,
            Err(e) => {
                warn!(error = %e, "Adapter events unavailable, link loss goes unnoticed");
                return;
            }
        };
        while let Some(event) = central.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event
                && gone == id
            {
                info!("Peripheral disconnected");
                let _ = events.send(LinkEvent::LinkDown);
                return;
            }
        }
    })
}

fn layout_of(peripheral: &Peripheral) -> (ServiceLayout, HashMap<Uuid, Characteristic>) {
    let mut cache = HashMap::new();
    let services = peripheral
        .services()
        .into_iter()
        .map(|service| ServiceInfo {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| {
                    let info = CharacteristicInfo {
                        uuid: c.uuid,
                        notify: c
                            .properties
                            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                        write: c.properties.intersects(
                            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                        ),
                    };
                    cache.insert(c.uuid, c);
                    info
                })
                .collect(),
        })
        .collect();
    (ServiceLayout { services }, cache)
}

#[async_trait]
impl Transport for BleTransport {
    fn has_required_capabilities(&self) -> bool {
        // btleplug surfaces missing permissions as errors on first use
        true
    }

    async fn scan(&self) -> Result<BoxStream<'static, DeviceHandle>> {
        let devices = with_retry(&RetryConfig::for_scan(), "scan", || self.scan_once()).await?;
        Ok(futures::stream::iter(devices).boxed())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(device = %device.id))]
    async fn connect(&self, device: &DeviceHandle) -> Result<BoxStream<'static, LinkEvent>> {
        self.disconnect().await?;
        let peripheral = self.find_peripheral(device).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(LinkEvent::Connecting);
        let connect_timeout = self.options.connect_timeout;
        with_retry(&self.options.connect_retry, "connect", || async {
            timeout(connect_timeout, peripheral.connect())
                .await
                .map_err(|_| Error::timeout("connect", connect_timeout))?
                .map_err(Error::from)
        })
        .await?;
        info!("Connected");
        let _ = tx.send(LinkEvent::LinkUp);

        let watcher = watch_link_down(self.adapter.clone(), peripheral.id(), tx.clone());
        *self.active.lock().await = Some(ActiveLink {
            peripheral,
            events: tx,
            characteristics: Arc::new(StdMutex::new(HashMap::new())),
            tasks: vec![watcher],
        });
        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn request_discovery(&self) -> Result<()> {
        let active = self.active.lock().await;
        let link = active.as_ref().ok_or(Error::NotConnected)?;
        let peripheral = link.peripheral.clone();
        let events = link.events.clone();
        let cache = link.characteristics.clone();
        let discovery_timeout = self.options.discovery_timeout;
        // Resolved asynchronously; the link driver waits for the event.
        tokio::spawn(async move {
            let event = match timeout(discovery_timeout, peripheral.discover_services()).await {
                Ok(Ok(())) => {
                    let (layout, characteristics) = layout_of(&peripheral);
                    debug!(services = layout.service_count(), "Services discovered");
                    if let Ok(mut cache) = cache.lock() {
                        *cache = characteristics;
                    }
                    LinkEvent::ServicesResolved(layout)
                }
                Ok(Err(e)) => LinkEvent::DiscoveryFailed(e.to_string()),
                Err(_) => LinkEvent::DiscoveryFailed(format!(
                    "no services after {discovery_timeout:?}"
                )),
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn enable_notifications(
        &self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Enablement> {
        let mut active = self.active.lock().await;
        let link = active.as_mut().ok_or(Error::NotConnected)?;
        let target = link.characteristic(characteristic).ok_or_else(|| {
            Error::characteristic_not_found(characteristic.to_string(), 0)
        })?;
        let peripheral = link.peripheral.clone();
        let events = link.events.clone();
        let codec = self.codec.clone();

        let pump = tokio::spawn(async move {
            // The subscribe call returns once the CCCD write completes.
            let subscribed = peripheral.subscribe(&target).await;
            if let Err(e) = &subscribed {
                warn!(error = %e, "Notification subscription failed");
            }
            let _ = events.send(LinkEvent::NotificationAck {
                success: subscribed.is_ok(),
            });
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Notification stream unavailable");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if notification.uuid != target.uuid {
                    continue;
                }
                match codec.decode_frame(&notification.value) {
                    Ok(payload) => {
                        if events.send(LinkEvent::Notification(payload)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, bytes = notification.value.len(), "Undecodable notification"),
                }
            }
            debug!("Notification stream ended");
        });
        link.tasks.push(pump);
        Ok(Enablement::AwaitAck)
    }

    async fn write(&self, characteristic: Uuid, bytes: Bytes) -> bool {
        let (peripheral, target) = {
            let active = self.active.lock().await;
            let Some(link) = active.as_ref() else {
                return false;
            };
            let Some(target) = link.characteristic(characteristic) else {
                debug!(%characteristic, "Write to unknown characteristic");
                return false;
            };
            (link.peripheral.clone(), target)
        };
        match timeout(
            self.options.write_timeout,
            peripheral.write(&target, &bytes, WriteType::WithResponse),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Write failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.options.write_timeout, "Write timed out");
                false
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.active.lock().await.take() else {
            return Ok(());
        };
        for task in &link.tasks {
            task.abort();
        }
        info!("Disconnecting");
        let result = link.peripheral.disconnect().await;
        link.emit(LinkEvent::LinkDown);
        result.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_target_band_service() {
        let options = BleOptions::default();
        assert_eq!(options.service, vitalband_types::uuids::BAND_SERVICE);
        assert!(options.connect_timeout > options.write_timeout);
    }
}
