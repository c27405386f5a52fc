//! Session behaviour against the mock collaborators.
//!
//! Every test runs on a paused clock, so pacing and debounce assertions are
//! exact.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, sleep};

use vitalband_core::mock::{MemoryStore, MockAck, MockCodec, MockTransport};
use vitalband_core::{
    DeviceHandle, Error, FramePayload, SampleStore, Session, SessionConfig, SessionEvent,
};
use vitalband_types::{
    BatteryLevel, HeartRateSample, LinkState, Metric, SpotMeasurement, TypedSample,
};

const BRING_UP: [&str; 9] = [
    "set_device_time",
    "battery_level",
    "enable_realtime",
    "history_heart_rate",
    "history_blood_oxygen",
    "history_hrv",
    "history_sleep",
    "history_total_steps",
    "history_temperature",
];

struct Harness {
    transport: Arc<MockTransport>,
    codec: Arc<MockCodec>,
    store: MemoryStore,
    session: Session,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let transport = Arc::new(MockTransport::new());
    let codec = Arc::new(MockCodec::new());
    let store = MemoryStore::new();
    let session = Session::new(
        transport.clone(),
        codec.clone(),
        Arc::new(store.clone()),
        SessionConfig::default(),
    )
    .unwrap();
    Harness {
        transport,
        codec,
        store,
        session,
    }
}

fn band() -> DeviceHandle {
    DeviceHandle::new("AA:BB:CC:DD:EE:01").with_name("Band 01")
}

fn frame(json: &str) -> FramePayload {
    FramePayload::Text(json.to_string())
}

/// Connect and let the bring-up sequence finish.
async fn connected(h: &Harness) {
    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.session.link_state(), LinkState::StreamingReady);
    h.transport.clear_writes();
}

fn offsets_ms(h: &Harness, start: Instant) -> Vec<u128> {
    h.transport
        .writes()
        .iter()
        .map(|w| w.at.duration_since(start).as_millis())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_bring_up_follows_streaming_ready() {
    let h = harness();
    let start = Instant::now();

    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.transport.written_commands(), BRING_UP);
    assert_eq!(
        offsets_ms(&h, start),
        vec![300, 800, 1_300, 3_300, 4_300, 5_300, 6_300, 7_300, 8_300]
    );
}

#[tokio::test(start_paused = true)]
async fn test_bring_up_after_ack_timeout() {
    let h = harness();
    h.transport.set_ack(MockAck::Never);
    let start = Instant::now();

    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(h.session.link_state(), LinkState::StreamingReady);
    assert_eq!(offsets_ms(&h, start)[0], 2_300);
    assert_eq!(h.transport.written_commands().len(), BRING_UP.len());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_aborts_bring_up() {
    let h = harness();
    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_millis(1_100)).await;

    h.session.disconnect().await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(
        h.transport.written_commands(),
        vec!["set_device_time", "battery_level"]
    );
    assert_eq!(h.session.link_state(), LinkState::Disconnected);
    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.link_state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_repeats_bring_up() {
    let h = harness();
    connected(&h).await;
    h.session.disconnect().await.unwrap();

    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.transport.written_commands(), BRING_UP);
    assert_eq!(h.transport.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_before_transport() {
    let h = harness();
    h.transport.set_capabilities(false);

    let result = h.session.connect(&band()).await;

    assert!(matches!(result, Err(Error::PermissionDenied)));
    assert_eq!(h.transport.connect_count(), 0);
    assert_eq!(h.session.link_state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connection_state_feed_replays_current() {
    let h = harness();
    let mut states = h.session.connection_state();
    assert_eq!(states.next().await, Some(LinkState::Disconnected));

    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(
        h.session.connection_state().next().await,
        Some(LinkState::StreamingReady)
    );
}

#[tokio::test(start_paused = true)]
async fn test_live_burst_persists_trailing_frame() {
    let h = harness();
    connected(&h).await;

    h.transport
        .notify(frame(r#"{"dataType": 23, "dicData": {"heartRate": 75}}"#));
    sleep(Duration::from_millis(500)).await;
    h.transport
        .notify(frame(r#"{"dataType": "23", "dicData": {"heartRate": "76"}}"#));
    sleep(Duration::from_secs(3)).await;

    assert_eq!(h.store.count(Metric::HeartRate), 1);
    let latest = h.session.latest(Metric::HeartRate).next().await;
    match latest {
        Some(TypedSample::HeartRate(hr)) => assert_eq!(hr.bpm, 76),
        other => panic!("unexpected latest value {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_history_frames_are_persisted() {
    let h = harness();
    connected(&h).await;

    h.transport.notify(frame(
        "{dataType=42, dicData=[{date=2024.03.01 08:00:00, highBP=121, lowBP=79, heartRate=64}, \
         {date=2024-03-01 09:00:00, highBP=, lowBP=80}]}",
    ));
    h.transport.notify(frame(
        r#"{"dataType": 26, "dicData": [{"date": "2024.03.01 23:00:00", "sleepUnitLength": 5, "arraySleepQuality": "1 5 12 30"}]}"#,
    ));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.store.count(Metric::BloodPressure), 1);
    assert_eq!(h.store.count(Metric::Sleep), 4);

    let summary = h.session.sleep_summary("2024-03-01").await.unwrap().unwrap();
    assert_eq!(summary.in_bed_minutes, 20);
    assert_eq!(summary.awake_minutes, 5);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_frames_are_reported() {
    let h = harness();
    let mut events = h.session.events();
    connected(&h).await;

    h.transport
        .notify(frame(r#"{"dataType": 77, "dicData": {}}"#));
    sleep(Duration::from_millis(50)).await;

    let mut dropped = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::FrameDropped { message_type, .. } = event {
            dropped = Some(message_type);
        }
    }
    assert_eq!(dropped, Some(Some(77)));
}

#[tokio::test(start_paused = true)]
async fn test_battery_resets_on_disconnect() {
    let h = harness();
    connected(&h).await;

    h.transport
        .notify(frame(r#"{"dataType": 9, "dicData": {"batteryLevel": 64}}"#));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.current_battery_level(), BatteryLevel::Percent(64));

    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.current_battery_level(), BatteryLevel::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_resets_battery() {
    let h = harness();
    connected(&h).await;
    h.transport
        .notify(frame(r#"{"dataType": 9, "dicData": {"batteryLevel": 30}}"#));
    sleep(Duration::from_millis(50)).await;

    h.transport.emit(vitalband_core::LinkEvent::LinkDown);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.session.link_state(), LinkState::Disconnected);
    assert_eq!(h.session.current_battery_level(), BatteryLevel::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_spot_measurement_contract() {
    let h = harness();
    assert!(matches!(
        h.session
            .start_spot_measurement(SpotMeasurement::HeartRate)
            .await,
        Err(Error::NotConnected)
    ));

    connected(&h).await;
    h.session
        .start_spot_measurement(SpotMeasurement::BloodOxygen)
        .await
        .unwrap();
    assert_eq!(h.transport.written_commands(), vec!["start_measurement"]);

    h.transport.set_accept_writes(false);
    assert!(matches!(
        h.session
            .start_spot_measurement(SpotMeasurement::HeartRate)
            .await,
        Err(Error::WriteFailed(_))
    ));

    h.codec.fail_command("start_measurement");
    assert!(matches!(
        h.session
            .start_spot_measurement(SpotMeasurement::HeartRate)
            .await,
        Err(Error::Codec(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_battery_requires_connection() {
    let h = harness();
    assert!(matches!(
        h.session.refresh_battery_level().await,
        Err(Error::NotConnected)
    ));

    connected(&h).await;
    h.session.refresh_battery_level().await.unwrap();
    assert_eq!(h.transport.written_commands(), vec!["battery_level"]);
}

#[tokio::test(start_paused = true)]
async fn test_commands_during_bring_up_keep_the_gap() {
    let h = harness();
    h.session.connect(&band()).await.unwrap();
    sleep(Duration::from_millis(1_300)).await;

    h.session
        .start_spot_measurement(SpotMeasurement::HeartRate)
        .await
        .unwrap();
    h.session.refresh_battery_level().await.unwrap();
    sleep(Duration::from_secs(10)).await;

    let writes = h.transport.writes();
    assert_eq!(writes.len(), BRING_UP.len() + 2);
    let names = h.transport.written_commands();
    assert!(names.contains(&"start_measurement".to_string()));
    let min_gap = writes
        .windows(2)
        .map(|pair| pair[1].at.duration_since(pair[0].at))
        .min()
        .unwrap();
    assert!(min_gap >= Duration::from_millis(500), "gap was {min_gap:?}");
}

#[tokio::test(start_paused = true)]
async fn test_sync_history_paced() {
    let h = harness();
    assert!(matches!(
        h.session.sync_historical_data().await,
        Err(Error::NotConnected)
    ));

    connected(&h).await;
    let start = Instant::now();
    let report = h.session.sync_historical_data().await.unwrap();

    assert_eq!(report.issued, 6);
    assert_eq!(h.transport.written_commands(), BRING_UP[3..]);
    assert_eq!(
        offsets_ms(&h, start),
        vec![0, 1_000, 2_000, 3_000, 4_000, 5_000]
    );
}

#[tokio::test(start_paused = true)]
async fn test_sync_aborted_by_disconnect() {
    let h = harness();
    connected(&h).await;

    let (result, _) = tokio::join!(h.session.sync_historical_data(), async {
        sleep(Duration::from_millis(2_500)).await;
        h.session.disconnect().await
    });

    assert!(matches!(result, Err(Error::NotConnected)));
    assert_eq!(h.transport.written_commands().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_device_details() {
    let h = harness();
    connected(&h).await;

    h.session.request_device_details().await.unwrap();
    h.transport
        .notify(frame(r#"{"dataType": 11, "dicData": "1.4.2"}"#));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.transport.written_commands(),
        vec!["firmware_version", "mac_address"]
    );
    let details = h.session.device_details().next().await.unwrap();
    assert_eq!(details.firmware_version.as_deref(), Some("1.4.2"));
}

#[tokio::test(start_paused = true)]
async fn test_recent_history_limits() {
    let h = harness();
    let samples = (0..3)
        .map(|i| {
            TypedSample::HeartRate(HeartRateSample {
                timestamp_millis: 1_709_287_200_000 + i * 60_000,
                day: "2024.03.01".to_string(),
                bpm: 60 + i as u16,
            })
        })
        .collect();
    h.store.insert_batch(Metric::HeartRate, samples).await.unwrap();

    let all = h
        .session
        .recent_history(Metric::HeartRate, None)
        .next()
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let two = h
        .session
        .recent_history(Metric::HeartRate, Some(2))
        .next()
        .await
        .unwrap();
    assert_eq!(two.len(), 2);
    assert_eq!(two[0].timestamp_millis(), 1_709_287_320_000);
}

#[tokio::test(start_paused = true)]
async fn test_close_tears_everything_down() {
    let h = harness();
    connected(&h).await;

    h.session.close().await;

    assert_eq!(h.session.link_state(), LinkState::Disconnected);
    assert!(!h.transport.notify(frame(r#"{"dataType": 9, "dicData": 50}"#)));
    assert!(h.transport.disconnect_count() >= 1);
}
