//! [`SampleStore`] over SQLite.
//!
//! Queries run on Tokio's blocking pool behind one connection. Each metric
//! has a revision counter that is bumped after a successful write; feeds
//! re-run their query whenever it moves.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use vitalband_core::{Feed, SampleStore, revision_feed};
use vitalband_types::{Metric, TypedSample};

use crate::error::{Error, Result};
use crate::store::Store;

struct Shared {
    store: Mutex<Store>,
    revisions: HashMap<Metric, watch::Sender<u64>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, metric: Metric) {
        if let Some(revision) = self.revisions.get(&metric) {
            revision.send_modify(|n| *n = n.wrapping_add(1));
        }
    }
}

/// A reactive, SQLite-backed sample store.
///
/// Cheap to clone; clones share the connection and the feeds.
#[derive(Clone)]
pub struct SqliteSampleStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SqliteSampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSampleStore").finish_non_exhaustive()
    }
}

impl SqliteSampleStore {
    pub fn new(store: Store) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                revisions: Metric::ALL
                    .into_iter()
                    .map(|metric| (metric, watch::channel(0).0))
                    .collect(),
            }),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Store::open(path).map(Self::new)
    }

    pub fn open_default() -> Result<Self> {
        Store::open_default().map(Self::new)
    }

    pub fn open_in_memory() -> Result<Self> {
        Store::open_in_memory().map(Self::new)
    }

    /// Run `op` against the store on the blocking pool.
    pub async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || op(&shared.lock()))
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
    }

    pub async fn count(&self, metric: Metric) -> Result<u64> {
        self.with_store(move |store| store.count(metric)).await
    }

    fn feed<T, F>(&self, metric: Metric, query: F) -> Feed<T>
    where
        T: Send + 'static,
        F: Fn(&Store) -> Result<T> + Send + Sync + 'static,
    {
        let Some(revisions) = self.shared.revisions.get(&metric).map(watch::Sender::subscribe)
        else {
            return futures::stream::empty().boxed();
        };
        let this = self.clone();
        let query = Arc::new(query);
        revision_feed(revisions, move || {
            let this = this.clone();
            let query = query.clone();
            async move {
                this.with_store(move |store| query(store))
                    .await
                    .map_err(vitalband_core::Error::from)
            }
        })
    }
}

#[async_trait]
impl SampleStore for SqliteSampleStore {
    async fn insert(&self, sample: TypedSample) -> vitalband_core::Result<()> {
        let metric = sample.metric();
        self.with_store(move |store| store.insert(&sample)).await?;
        self.shared.bump(metric);
        Ok(())
    }

    async fn insert_batch(
        &self,
        metric: Metric,
        samples: Vec<TypedSample>,
    ) -> vitalband_core::Result<usize> {
        let count = self
            .with_store(move |store| store.insert_batch(metric, &samples))
            .await?;
        self.shared.bump(metric);
        Ok(count)
    }

    fn latest(&self, metric: Metric) -> Feed<Option<TypedSample>> {
        self.feed(metric, move |store| store.latest(metric))
    }

    fn history(&self, metric: Metric) -> Feed<Vec<TypedSample>> {
        self.feed(metric, move |store| store.all(metric))
    }

    fn recent(&self, metric: Metric, limit: usize) -> Feed<Vec<TypedSample>> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        self.feed(metric, move |store| store.recent(metric, limit))
    }

    async fn range(
        &self,
        metric: Metric,
        start_millis: i64,
        end_millis: i64,
    ) -> vitalband_core::Result<Vec<TypedSample>> {
        Ok(self
            .with_store(move |store| store.range(metric, start_millis, end_millis))
            .await?)
    }

    async fn by_day(&self, metric: Metric, day: &str) -> vitalband_core::Result<Vec<TypedSample>> {
        let day = day.to_string();
        Ok(self
            .with_store(move |store| store.by_day(metric, &day))
            .await?)
    }

    async fn clear(&self, metric: Metric) -> vitalband_core::Result<()> {
        self.with_store(move |store| store.clear(metric)).await?;
        self.shared.bump(metric);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;
    use vitalband_types::HeartRateSample;

    fn heart_rate(timestamp_millis: i64, bpm: u16) -> TypedSample {
        HeartRateSample {
            timestamp_millis,
            day: "2024.03.01".to_string(),
            bpm,
        }
        .into()
    }

    #[tokio::test]
    async fn test_latest_feed_follows_writes() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let mut latest = store.latest(Metric::HeartRate);
        assert_eq!(latest.next().await, Some(None));

        store.insert(heart_rate(1_000, 70)).await.unwrap();
        assert_eq!(latest.next().await, Some(Some(heart_rate(1_000, 70))));

        store
            .insert_batch(Metric::HeartRate, vec![heart_rate(500, 60), heart_rate(2_000, 74)])
            .await
            .unwrap();
        assert_eq!(latest.next().await, Some(Some(heart_rate(2_000, 74))));
    }

    #[tokio::test]
    async fn test_feed_ignores_other_metrics() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let mut steps = store.history(Metric::Steps);
        assert_eq!(steps.next().await, Some(vec![]));

        store.insert(heart_rate(1_000, 70)).await.unwrap();
        assert!(
            timeout(Duration::from_millis(100), steps.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_recent_feed_and_clear() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        store
            .insert_batch(
                Metric::HeartRate,
                (1..=4).map(|i| heart_rate(i * 1_000, 60)).collect(),
            )
            .await
            .unwrap();

        let mut recent = store.recent(Metric::HeartRate, 3);
        assert_eq!(recent.next().await.map(|v| v.len()), Some(3));

        store.clear(Metric::HeartRate).await.unwrap();
        assert_eq!(recent.next().await, Some(vec![]));
        assert_eq!(store.count(Metric::HeartRate).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_surfaces_as_storage_error() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let err = store
            .insert_batch(Metric::Sleep, vec![heart_rate(1_000, 70)])
            .await
            .unwrap_err();
        assert!(matches!(err, vitalband_core::Error::Storage(_)));
    }
}
