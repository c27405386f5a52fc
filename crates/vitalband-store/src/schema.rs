//! Database schema and migrations.
//!
//! One table per metric, keyed by the sample timestamp in epoch
//! milliseconds. Every table carries the `day` string the sample was filed
//! under so day queries never depend on the reader's time zone.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Create the tables on a fresh database, or bring an older one up to date.
pub fn initialize(conn: &Connection) -> Result<()> {
    match stored_version(conn)? {
        None => {
            create_schema_v1(conn)?;
            record_version(conn)?;
        }
        Some(version) if version < SCHEMA_VERSION => migrate(conn, version)?,
        Some(_) => {}
    }
    Ok(())
}

/// Version recorded in the database, `None` before the first initialization.
fn stored_version(conn: &Connection) -> Result<Option<i32>> {
    let has_table = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_table {
        return Ok(None);
    }
    Ok(conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?)
}

fn record_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS heart_rate (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            bpm INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_heart_rate_day ON heart_rate(day);

        CREATE TABLE IF NOT EXISTS blood_oxygen (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            percent INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_blood_oxygen_day ON blood_oxygen(day);

        CREATE TABLE IF NOT EXISTS blood_pressure (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            systolic INTEGER NOT NULL,
            diastolic INTEGER NOT NULL,
            heart_rate INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_blood_pressure_day ON blood_pressure(day);

        CREATE TABLE IF NOT EXISTS temperature (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            celsius REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_temperature_day ON temperature(day);

        CREATE TABLE IF NOT EXISTS steps (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            steps INTEGER NOT NULL,
            distance REAL NOT NULL,
            calories REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_steps_day ON steps(day);

        -- Sleep stages; the stage is stored alongside the raw code so a
        -- change in decoding never rewrites old nights.
        CREATE TABLE IF NOT EXISTS sleep (
            timestamp INTEGER PRIMARY KEY,
            day TEXT NOT NULL,
            code REAL NOT NULL,
            stage TEXT NOT NULL,
            unit_minutes INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sleep_day ON sleep(day);
        "#,
    )?;

    Ok(())
}

fn migrate(conn: &Connection, from: i32) -> Result<()> {
    // Version 1 is the first layout; later versions add their steps here.
    tracing::info!(from, to = SCHEMA_VERSION, "Migrating sample database");
    record_version(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalband_types::Metric;

    #[test]
    fn test_initialize_creates_a_table_per_metric() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|name| name.unwrap())
            .collect();

        for metric in Metric::ALL {
            assert!(tables.contains(&metric.as_str().to_string()), "{metric}");
        }
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_version_is_recorded_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(stored_version(&conn).unwrap(), None);

        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_older_version_is_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute("UPDATE schema_version SET version = 0", []).unwrap();

        initialize(&conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }
}
