//! Session event system.
//!
//! Observers subscribe to a broadcast feed of [`SessionEvent`]s describing
//! link transitions, device updates and what happened to inbound data.
//! Events are informational only; nothing in the session waits on them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use vitalband_types::{BatteryLevel, DeviceDetails, LinkState, Metric};

use crate::traits::DeviceHandle;

/// Events emitted by a session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A band was seen during scanning.
    DeviceDiscovered { device: DeviceHandle },
    /// The link moved between states.
    LinkStateChanged { from: LinkState, to: LinkState },
    /// A battery frame updated the level.
    BatteryUpdated { level: BatteryLevel },
    /// Firmware version or MAC address changed.
    DetailsUpdated { details: DeviceDetails },
    /// An inbound frame was dropped.
    FrameDropped {
        message_type: Option<i64>,
        reason: String,
    },
    /// Records inside a frame were rejected by the normalizer.
    RecordsRejected { metric: Metric, count: usize },
    /// A choreography command was written.
    CommandIssued { command: String },
    /// A choreography command was skipped because there were no bytes to send
    /// or the write failed.
    CommandSkipped { command: String },
    /// A batch of samples was persisted.
    BatchPersisted { metric: Metric, count: usize },
    /// A live feed received a new value.
    LiveUpdated { metric: Metric },
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event. Having no subscribers is fine.
    pub fn send(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_subscribers() {
        let dispatcher = EventDispatcher::new(8);
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(SessionEvent::BatchPersisted {
            metric: Metric::HeartRate,
            count: 3,
        });

        for rx in [&mut first, &mut second] {
            assert_eq!(
                rx.recv().await.unwrap(),
                SessionEvent::BatchPersisted {
                    metric: Metric::HeartRate,
                    count: 3
                }
            );
        }
    }

    #[test]
    fn test_send_without_subscribers() {
        EventDispatcher::default().send(SessionEvent::LiveUpdated {
            metric: Metric::Steps,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::LinkStateChanged {
            from: LinkState::Connected,
            to: LinkState::StreamingReady,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"link_state_changed\""));
        assert!(json.contains("\"to\":\"streaming_ready\""));
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
