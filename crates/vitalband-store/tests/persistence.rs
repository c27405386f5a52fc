//! On-disk behaviour of the SQLite store.

use std::sync::Arc;

use futures::StreamExt;
use vitalband_core::sleep::load_summary;
use vitalband_core::{EventDispatcher, FramePayload, IngestConfig, Multiplexer, SampleStore};
use vitalband_store::{SampleQuery, SqliteSampleStore, Store};
use vitalband_types::{HeartRateSample, Metric, TypedSample};

const NIGHT: &str = r#"{"dataType": 26, "dicData": [{"date": "2024.03.01 23:00:00", "sleepUnitLength": 1, "arraySleepQuality": "4 1 1 2 3 4"}]}"#;

fn heart_rate(timestamp_millis: i64, bpm: u16) -> TypedSample {
    HeartRateSample {
        timestamp_millis,
        day: "2024.03.01".to_string(),
        bpm,
    }
    .into()
}

async fn replay(store: &SqliteSampleStore, frames: &[&str]) {
    let mux = Multiplexer::spawn(
        Arc::new(store.clone()),
        &IngestConfig::default(),
        EventDispatcher::default(),
        16,
    );
    for frame in frames {
        mux.push(FramePayload::Text(frame.to_string())).await.unwrap();
    }
    mux.shutdown().await;
}

#[test]
fn test_samples_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.db");

    {
        let store = Store::open(&path).unwrap();
        store.insert(&heart_rate(1_000, 61)).unwrap();
        store.insert(&heart_rate(2_000, 62)).unwrap();
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.count(Metric::HeartRate).unwrap(), 2);
    assert_eq!(
        store
            .query(&SampleQuery::new(Metric::HeartRate).oldest_first().limit(1))
            .unwrap(),
        vec![heart_rate(1_000, 61)]
    );
}

#[test]
fn test_open_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("samples.db");

    Store::open(&path).unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_replaying_history_twice_keeps_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteSampleStore::open(dir.path().join("samples.db")).unwrap();

    replay(&store, &[NIGHT]).await;
    replay(&store, &[NIGHT]).await;

    assert_eq!(store.count(Metric::Sleep).await.unwrap(), 6);
}

#[tokio::test]
async fn test_sleep_summary_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteSampleStore::open(dir.path().join("samples.db")).unwrap();
    replay(
        &store,
        &[
            NIGHT,
            r#"{"dataType": 28, "dicData": [{"date": "2024.03.01 23:02:00", "onceHeartValue": 52}]}"#,
        ],
    )
    .await;

    let summary = load_summary(&store, "2024.03.01").await.unwrap().unwrap();
    assert_eq!(summary.in_bed_minutes, 6);
    assert_eq!(summary.deep_minutes, 2);
    assert_eq!(summary.latency_minutes, 1);
    assert_eq!(summary.heart_rate.len(), 1);
    assert_eq!(summary.heart_rate[0].bpm, 52);
}

#[tokio::test]
async fn test_feeds_from_two_handles_share_revisions() {
    let store = SqliteSampleStore::open_in_memory().unwrap();
    let writer = store.clone();
    let mut history = store.history(Metric::HeartRate);
    assert_eq!(history.next().await, Some(vec![]));

    writer.insert(heart_rate(1_000, 70)).await.unwrap();
    assert_eq!(history.next().await, Some(vec![heart_rate(1_000, 70)]));
}
