//! Synchronous SQLite store.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use vitalband_types::{
    BloodOxygenSample, BloodPressureSample, HeartRateSample, Metric, SleepStage,
    SleepStageSample, StepSample, TemperatureSample, TypedSample, canonical_day,
};

use crate::error::{Error, Result};
use crate::queries::{SampleQuery, columns};
use crate::schema;

/// Number of samples returned by [`Store::recent`] callers that do not pick
/// a limit.
pub const DEFAULT_RECENT_LIMIT: u32 = 500;

/// SQLite-based store for band samples.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Writes
impl Store {
    /// Insert one sample, replacing any sample of the same metric with the
    /// same timestamp.
    pub fn insert(&self, sample: &TypedSample) -> Result<()> {
        upsert(&self.conn, sample)?;
        debug!(metric = %sample.metric(), timestamp = sample.timestamp_millis(), "Stored sample");
        Ok(())
    }

    /// Insert samples of one metric in a single transaction.
    ///
    /// Nothing is written if any sample belongs to another metric.
    pub fn insert_batch(&self, metric: Metric, samples: &[TypedSample]) -> Result<usize> {
        if let Some(other) = samples.iter().find(|s| s.metric() != metric) {
            return Err(Error::MetricMismatch {
                expected: metric.to_string(),
                found: other.metric().to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        for sample in samples {
            upsert(&tx, sample)?;
        }
        tx.commit()?;

        info!(%metric, count = samples.len(), "Stored batch");
        Ok(samples.len())
    }

    /// Delete every sample of `metric`, returning how many were removed.
    pub fn clear(&self, metric: Metric) -> Result<usize> {
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {}", metric.as_str()), [])?;
        info!(%metric, removed, "Cleared samples");
        Ok(removed)
    }
}

// Reads
impl Store {
    /// Run a query.
    pub fn query(&self, query: &SampleQuery) -> Result<Vec<TypedSample>> {
        let (sql, params) = query.build_sql();
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let metric = query.metric;

        let mut stmt = self.conn.prepare(&sql)?;
        let samples = stmt
            .query_map(param_refs.as_slice(), |row| read_sample(metric, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    /// The newest sample of `metric`.
    pub fn latest(&self, metric: Metric) -> Result<Option<TypedSample>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY timestamp DESC LIMIT 1",
            columns(metric),
            metric.as_str()
        );
        let sample = self
            .conn
            .query_row(&sql, [], |row| read_sample(metric, row))
            .optional()?;
        Ok(sample)
    }

    /// Every sample of `metric`, newest first.
    pub fn all(&self, metric: Metric) -> Result<Vec<TypedSample>> {
        self.query(&SampleQuery::new(metric))
    }

    /// The `limit` newest samples of `metric`, newest first.
    pub fn recent(&self, metric: Metric, limit: u32) -> Result<Vec<TypedSample>> {
        self.query(&SampleQuery::new(metric).limit(limit))
    }

    /// Samples with `start <= timestamp < end`, oldest first.
    pub fn range(&self, metric: Metric, start_millis: i64, end_millis: i64) -> Result<Vec<TypedSample>> {
        self.query(
            &SampleQuery::new(metric)
                .since(start_millis)
                .until(end_millis)
                .oldest_first(),
        )
    }

    /// Samples filed under `day`, oldest first.
    ///
    /// `day` may be given as `yyyy.MM.dd` or `yyyy-MM-dd`.
    pub fn by_day(&self, metric: Metric, day: &str) -> Result<Vec<TypedSample>> {
        let day = canonical_day(day)?;
        self.query(&SampleQuery::new(metric).day(day).oldest_first())
    }

    /// Number of stored samples of `metric`.
    pub fn count(&self, metric: Metric) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", metric.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn upsert(conn: &Connection, sample: &TypedSample) -> Result<usize> {
    let changed = match sample {
        TypedSample::HeartRate(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO heart_rate (timestamp, day, bpm) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![s.timestamp_millis, s.day, s.bpm])?,
        TypedSample::BloodOxygen(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO blood_oxygen (timestamp, day, percent) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![s.timestamp_millis, s.day, s.percent])?,
        TypedSample::BloodPressure(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO blood_pressure
                 (timestamp, day, systolic, diastolic, heart_rate) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                s.timestamp_millis,
                s.day,
                s.systolic,
                s.diastolic,
                s.heart_rate
            ])?,
        TypedSample::Temperature(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO temperature (timestamp, day, celsius) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![s.timestamp_millis, s.day, f64::from(s.celsius)])?,
        TypedSample::Steps(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO steps (timestamp, day, steps, distance, calories)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                s.timestamp_millis,
                s.day,
                s.steps,
                f64::from(s.distance),
                f64::from(s.calories)
            ])?,
        TypedSample::Sleep(s) => conn
            .prepare_cached(
                "INSERT OR REPLACE INTO sleep (timestamp, day, code, stage, unit_minutes)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                s.timestamp_millis,
                s.day,
                f64::from(s.code),
                s.stage.as_str(),
                s.unit_minutes
            ])?,
    };
    Ok(changed)
}

fn read_sample(metric: Metric, row: &Row<'_>) -> rusqlite::Result<TypedSample> {
    let timestamp_millis: i64 = row.get(0)?;
    let day: String = row.get(1)?;
    let sample = match metric {
        Metric::HeartRate => HeartRateSample {
            timestamp_millis,
            day,
            bpm: row.get(2)?,
        }
        .into(),
        Metric::BloodOxygen => BloodOxygenSample {
            timestamp_millis,
            day,
            percent: row.get(2)?,
        }
        .into(),
        Metric::BloodPressure => BloodPressureSample {
            timestamp_millis,
            day,
            systolic: row.get(2)?,
            diastolic: row.get(3)?,
            heart_rate: row.get(4)?,
        }
        .into(),
        Metric::Temperature => TemperatureSample {
            timestamp_millis,
            day,
            celsius: row.get::<_, f64>(2)? as f32,
        }
        .into(),
        Metric::Steps => StepSample {
            timestamp_millis,
            day,
            steps: row.get(2)?,
            distance: row.get::<_, f64>(3)? as f32,
            calories: row.get::<_, f64>(4)? as f32,
        }
        .into(),
        Metric::Sleep => {
            let stage: String = row.get(3)?;
            let stage: SleepStage = stage
                .parse()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
            SleepStageSample {
                timestamp_millis,
                day,
                code: row.get::<_, f64>(2)? as f32,
                stage,
                unit_minutes: row.get(4)?,
            }
            .into()
        }
    };
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heart_rate(timestamp_millis: i64, bpm: u16) -> TypedSample {
        HeartRateSample {
            timestamp_millis,
            day: "2024.03.01".to_string(),
            bpm,
        }
        .into()
    }

    fn stage(timestamp_millis: i64, day: &str, stage: SleepStage) -> TypedSample {
        SleepStageSample {
            timestamp_millis,
            day: day.to_string(),
            code: 2.0,
            stage,
            unit_minutes: 1,
        }
        .into()
    }

    #[test]
    fn test_insert_and_latest() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.latest(Metric::HeartRate).unwrap(), None);

        store.insert(&heart_rate(2_000, 70)).unwrap();
        store.insert(&heart_rate(1_000, 60)).unwrap();

        assert_eq!(store.latest(Metric::HeartRate).unwrap(), Some(heart_rate(2_000, 70)));
        assert_eq!(store.count(Metric::HeartRate).unwrap(), 2);
        assert_eq!(store.count(Metric::BloodOxygen).unwrap(), 0);
    }

    #[test]
    fn test_same_timestamp_replaces() {
        let store = Store::open_in_memory().unwrap();
        store.insert(&heart_rate(1_000, 60)).unwrap();
        store.insert(&heart_rate(1_000, 65)).unwrap();

        assert_eq!(store.all(Metric::HeartRate).unwrap(), vec![heart_rate(1_000, 65)]);
    }

    #[test]
    fn test_batch_rejects_mixed_metrics() {
        let store = Store::open_in_memory().unwrap();
        let mixed = vec![
            heart_rate(1_000, 60),
            stage(2_000, "2024.03.01", SleepStage::Deep),
        ];

        let err = store.insert_batch(Metric::HeartRate, &mixed).unwrap_err();
        assert!(matches!(err, Error::MetricMismatch { .. }));
        assert_eq!(store.count(Metric::HeartRate).unwrap(), 0);
    }

    #[test]
    fn test_recent_and_range_ordering() {
        let store = Store::open_in_memory().unwrap();
        let samples: Vec<_> = (1..=5).map(|i| heart_rate(i * 1_000, 60 + i as u16)).collect();
        assert_eq!(store.insert_batch(Metric::HeartRate, &samples).unwrap(), 5);

        let recent = store.recent(Metric::HeartRate, 2).unwrap();
        assert_eq!(recent, vec![heart_rate(5_000, 65), heart_rate(4_000, 64)]);

        let range = store.range(Metric::HeartRate, 2_000, 4_000).unwrap();
        assert_eq!(range, vec![heart_rate(2_000, 62), heart_rate(3_000, 63)]);
    }

    #[test]
    fn test_by_day_accepts_either_separator() {
        let store = Store::open_in_memory().unwrap();
        let night = vec![
            stage(3_000, "2024.03.02", SleepStage::Rem),
            stage(1_000, "2024.03.01", SleepStage::Awake),
            stage(2_000, "2024.03.01", SleepStage::Deep),
        ];
        store.insert_batch(Metric::Sleep, &night).unwrap();

        let day = store.by_day(Metric::Sleep, "2024-03-01").unwrap();
        assert_eq!(
            day,
            vec![
                stage(1_000, "2024.03.01", SleepStage::Awake),
                stage(2_000, "2024.03.01", SleepStage::Deep),
            ]
        );
        assert!(matches!(
            store.by_day(Metric::Sleep, "yesterday"),
            Err(Error::InvalidDay(_))
        ));
    }

    #[test]
    fn test_every_metric_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let day = "2024.03.01".to_string();
        let samples: Vec<TypedSample> = vec![
            heart_rate(1_000, 72),
            BloodOxygenSample { timestamp_millis: 1_000, day: day.clone(), percent: 97 }.into(),
            BloodPressureSample {
                timestamp_millis: 1_000,
                day: day.clone(),
                systolic: 120,
                diastolic: 80,
                heart_rate: 0,
            }
            .into(),
            TemperatureSample { timestamp_millis: 1_000, day: day.clone(), celsius: 36.5 }.into(),
            StepSample {
                timestamp_millis: 1_000,
                day: day.clone(),
                steps: 4_200,
                distance: 3.25,
                calories: 180.5,
            }
            .into(),
            stage(1_000, &day, SleepStage::Light),
        ];

        for sample in &samples {
            store.insert(sample).unwrap();
            assert_eq!(store.latest(sample.metric()).unwrap().as_ref(), Some(sample));
        }
    }

    #[test]
    fn test_clear_only_touches_one_metric() {
        let store = Store::open_in_memory().unwrap();
        store.insert(&heart_rate(1_000, 60)).unwrap();
        store.insert(&stage(1_000, "2024.03.01", SleepStage::Deep)).unwrap();

        assert_eq!(store.clear(Metric::HeartRate).unwrap(), 1);
        assert_eq!(store.count(Metric::HeartRate).unwrap(), 0);
        assert_eq!(store.count(Metric::Sleep).unwrap(), 1);
    }
}
