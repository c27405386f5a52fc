//! Live feeds and the merged "current value" feed.
//!
//! Every metric except sleep has an in-memory live feed that replays its last
//! value to new subscribers. [`current_value`] merges such a feed with the
//! store's latest-sample feed so consumers see one stream per metric.
//!
//! By default the merge is last-arrival-wins: whichever source emitted most
//! recently is the current value, regardless of sample timestamps. The
//! [`MergePolicy::NewestTimestamp`] policy instead drops emissions older
//! than the newest value already surfaced.

use std::collections::HashMap;
use std::sync::RwLock;

use futures::StreamExt;
use futures::future::ready;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use vitalband_types::{Metric, TypedSample};

use crate::traits::Feed;

/// How the merged feed resolves live and stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The most recent emission wins.
    #[default]
    LastArrival,
    /// Emissions older than the newest value seen so far are dropped.
    NewestTimestamp,
}

/// Replay-1 live feeds, one per metric that streams live.
#[derive(Debug)]
pub struct LiveFeeds {
    senders: RwLock<HashMap<Metric, watch::Sender<Option<TypedSample>>>>,
}

impl Default for LiveFeeds {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveFeeds {
    pub fn new() -> Self {
        let senders = Metric::ALL
            .into_iter()
            .filter(Metric::has_live_feed)
            .map(|metric| (metric, watch::channel(None).0))
            .collect();
        Self {
            senders: RwLock::new(senders),
        }
    }

    /// Publish `sample` unconditionally. Returns false if its metric has no
    /// live feed or the feeds are closed.
    pub fn publish(&self, sample: TypedSample) -> bool {
        self.with_sender(sample.metric(), |tx| {
            tx.send_replace(Some(sample));
            true
        })
    }

    /// Publish `sample` only when it is newer than the current live value.
    pub fn publish_if_newer(&self, sample: TypedSample) -> bool {
        self.with_sender(sample.metric(), |tx| {
            tx.send_if_modified(|current| {
                let newer = current
                    .as_ref()
                    .is_none_or(|c| sample.timestamp_millis() > c.timestamp_millis());
                if newer {
                    *current = Some(sample);
                }
                newer
            })
        })
    }

    /// The current live value of `metric`.
    pub fn current(&self, metric: Metric) -> Option<TypedSample> {
        self.senders
            .read()
            .ok()?
            .get(&metric)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Live values of `metric`, starting with the current one if any.
    ///
    /// Returns an empty feed for metrics without a live feed or after
    /// [`close`](Self::close).
    pub fn feed(&self, metric: Metric) -> Feed<TypedSample> {
        let rx = self
            .senders
            .read()
            .ok()
            .and_then(|senders| senders.get(&metric).map(watch::Sender::subscribe));
        match rx {
            Some(rx) => watch_feed(rx),
            None => futures::stream::empty().boxed(),
        }
    }

    /// Drop every producer. Open feeds end.
    pub fn close(&self) {
        if let Ok(mut senders) = self.senders.write() {
            senders.clear();
        }
    }

    fn with_sender(
        &self,
        metric: Metric,
        f: impl FnOnce(&watch::Sender<Option<TypedSample>>) -> bool,
    ) -> bool {
        match self.senders.read() {
            Ok(senders) => senders.get(&metric).is_some_and(f),
            Err(_) => false,
        }
    }
}

/// Turn a replay-1 watch channel into a feed of its present values.
fn watch_feed(rx: watch::Receiver<Option<TypedSample>>) -> Feed<TypedSample> {
    futures::stream::unfold((rx, true), |(mut rx, mut first)| async move {
        loop {
            if !first {
                rx.changed().await.ok()?;
            }
            first = false;
            let current = rx.borrow_and_update().clone();
            if let Some(sample) = current {
                return Some((sample, (rx, false)));
            }
        }
    })
    .boxed()
}

/// Merge a store latest-sample feed with a live feed.
///
/// Neither source blocks the other: if one never emits, the other's values
/// still flow through.
pub fn current_value(
    stored: Feed<Option<TypedSample>>,
    live: Feed<TypedSample>,
    policy: MergePolicy,
) -> Feed<TypedSample> {
    let merged = futures::stream::select(stored.filter_map(ready), live);
    match policy {
        MergePolicy::LastArrival => merged.boxed(),
        MergePolicy::NewestTimestamp => merged
            .scan(None::<i64>, |newest, sample| {
                let ts = sample.timestamp_millis();
                let keep = newest.is_none_or(|n| ts >= n);
                if keep {
                    *newest = Some(ts);
                }
                ready(Some(keep.then_some(sample)))
            })
            .filter_map(ready)
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use vitalband_types::HeartRateSample;

    fn hr(timestamp_millis: i64, bpm: u16) -> TypedSample {
        TypedSample::HeartRate(HeartRateSample {
            timestamp_millis,
            day: "2024.03.01".to_string(),
            bpm,
        })
    }

    fn stored_feed() -> (mpsc::UnboundedSender<Option<TypedSample>>, Feed<Option<TypedSample>>) {
        let (tx, rx) = mpsc::unbounded();
        (tx, rx.boxed())
    }

    #[tokio::test]
    async fn test_live_feed_replays_last_value() {
        let feeds = LiveFeeds::new();
        feeds.publish(hr(1_000, 60));
        feeds.publish(hr(2_000, 61));

        let mut feed = feeds.feed(Metric::HeartRate);
        assert_eq!(feed.next().await, Some(hr(2_000, 61)));

        feeds.publish(hr(3_000, 62));
        assert_eq!(feed.next().await, Some(hr(3_000, 62)));
    }

    #[test]
    fn test_publish_if_newer() {
        let feeds = LiveFeeds::new();
        assert!(feeds.publish_if_newer(hr(2_000, 70)));
        assert!(!feeds.publish_if_newer(hr(1_000, 65)));
        assert!(!feeds.publish_if_newer(hr(2_000, 66)));
        assert_eq!(feeds.current(Metric::HeartRate), Some(hr(2_000, 70)));
        assert!(feeds.publish_if_newer(hr(3_000, 72)));
    }

    #[test]
    fn test_sleep_has_no_live_feed() {
        let feeds = LiveFeeds::new();
        let sample = TypedSample::Sleep(vitalband_types::SleepStageSample {
            timestamp_millis: 0,
            day: "2024.03.01".to_string(),
            code: 1.0,
            stage: vitalband_types::SleepStage::Deep,
            unit_minutes: 1,
        });
        assert!(!feeds.publish(sample));
        assert_eq!(feeds.current(Metric::Sleep), None);
    }

    #[tokio::test]
    async fn test_close_ends_feeds() {
        let feeds = LiveFeeds::new();
        let mut feed = feeds.feed(Metric::Steps);
        feeds.close();
        assert_eq!(feed.next().await, None);
        assert!(!feeds.publish(hr(1, 1)));
        assert_eq!(feeds.feed(Metric::HeartRate).next().await, None);
    }

    #[tokio::test]
    async fn test_live_after_stored_wins() {
        let feeds = LiveFeeds::new();
        let (stored_tx, stored) = stored_feed();
        let mut merged = current_value(
            stored,
            feeds.feed(Metric::HeartRate),
            MergePolicy::LastArrival,
        );

        stored_tx.unbounded_send(Some(hr(1_000, 60))).unwrap();
        assert_eq!(merged.next().await, Some(hr(1_000, 60)));

        feeds.publish(hr(2_000, 75));
        assert_eq!(merged.next().await, Some(hr(2_000, 75)));
    }

    #[tokio::test]
    async fn test_last_arrival_wins_even_if_older() {
        let feeds = LiveFeeds::new();
        let (stored_tx, stored) = stored_feed();
        let mut merged = current_value(
            stored,
            feeds.feed(Metric::HeartRate),
            MergePolicy::LastArrival,
        );

        feeds.publish(hr(2_000, 75));
        assert_eq!(merged.next().await, Some(hr(2_000, 75)));

        stored_tx.unbounded_send(Some(hr(1_000, 60))).unwrap();
        assert_eq!(merged.next().await, Some(hr(1_000, 60)));
    }

    #[tokio::test]
    async fn test_newest_timestamp_drops_stale_emissions() {
        let feeds = LiveFeeds::new();
        let (stored_tx, stored) = stored_feed();
        let mut merged = current_value(
            stored,
            feeds.feed(Metric::HeartRate),
            MergePolicy::NewestTimestamp,
        );

        feeds.publish(hr(2_000, 75));
        assert_eq!(merged.next().await, Some(hr(2_000, 75)));

        stored_tx.unbounded_send(Some(hr(1_000, 60))).unwrap();
        stored_tx.unbounded_send(Some(hr(3_000, 80))).unwrap();
        assert_eq!(merged.next().await, Some(hr(3_000, 80)));
    }

    #[tokio::test]
    async fn test_merge_without_live_values() {
        let feeds = LiveFeeds::new();
        let (stored_tx, stored) = stored_feed();
        let mut merged = current_value(
            stored,
            feeds.feed(Metric::HeartRate),
            MergePolicy::LastArrival,
        );

        stored_tx.unbounded_send(None).unwrap();
        stored_tx.unbounded_send(Some(hr(1_000, 60))).unwrap();
        assert_eq!(merged.next().await, Some(hr(1_000, 60)));
    }

    #[tokio::test]
    async fn test_merge_without_stored_values() {
        let feeds = LiveFeeds::new();
        let (_stored_tx, stored) = stored_feed();
        let mut merged = current_value(
            stored,
            feeds.feed(Metric::HeartRate),
            MergePolicy::LastArrival,
        );

        feeds.publish(hr(5_000, 90));
        assert_eq!(merged.next().await, Some(hr(5_000, 90)));
    }
}
