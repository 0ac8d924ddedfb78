//! SQLite reading store.
//!
//! The connection lives behind a mutex (SQLite connections are not `Sync`) and
//! every statement runs on the blocking pool so the async workers never stall
//! on disk I/O.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE readings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     device_id TEXT NOT NULL,
//!     sensor_id TEXT NOT NULL,
//!     sensor_name TEXT NOT NULL,
//!     timestamp_ms INTEGER NOT NULL,
//!     temperature REAL,
//!     humidity REAL,
//!     pressure REAL,
//!     predicted_temperature REAL,
//!     alarm INTEGER NOT NULL DEFAULT 0,
//!     alarm_message TEXT,
//!     exported INTEGER NOT NULL DEFAULT 0,
//!     tier TEXT NOT NULL
//! );
//! CREATE INDEX idx_readings_sensor_tier_ts ON readings(sensor_id, tier, timestamp_ms);
//! CREATE INDEX idx_readings_exported_tier ON readings(exported, tier);
//! ```

use super::{RangeQuery, ReadingStore};
use crate::error::{AppResult, GatewayError};
use crate::reading::{Reading, ReadingId, StorageTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const COLUMNS: &str = "id, device_id, sensor_id, sensor_name, timestamp_ms, temperature, humidity, \
                       pressure, predicted_temperature, alarm, alarm_message, exported, tier";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a file-backed database.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| GatewayError::Storage(format!("Failed to open SQLite database at {}: {e}", path.display())))?;
        Self::with_connection(conn)
    }

    /// In-memory database (for testing)
    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> AppResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                sensor_id TEXT NOT NULL,
                sensor_name TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                temperature REAL,
                humidity REAL,
                pressure REAL,
                predicted_temperature REAL,
                alarm INTEGER NOT NULL DEFAULT 0,
                alarm_message TEXT,
                exported INTEGER NOT NULL DEFAULT 0,
                tier TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_sensor_tier_ts
                ON readings(sensor_id, tier, timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_readings_exported_tier
                ON readings(exported, tier);",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| GatewayError::Storage(format!("storage task failed: {e}")))?
        .map_err(GatewayError::from)
    }

    fn row_to_reading(row: &rusqlite::Row) -> rusqlite::Result<Reading> {
        let timestamp_ms: i64 = row.get(4)?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| conversion_error(4, Type::Integer, format!("timestamp {timestamp_ms} out of range")))?;
        let tier: String = row.get(12)?;
        let tier = tier
            .parse::<StorageTier>()
            .map_err(|e| conversion_error(12, Type::Text, e))?;

        Ok(Reading {
            id: Some(row.get(0)?),
            device_id: row.get(1)?,
            sensor_id: row.get(2)?,
            sensor_name: row.get(3)?,
            timestamp,
            temperature: row.get(5)?,
            humidity: row.get(6)?,
            pressure: row.get(7)?,
            predicted_temperature: row.get(8)?,
            alarm: row.get(9)?,
            alarm_message: row.get(10)?,
            exported: row.get(11)?,
            tier,
        })
    }

    fn insert_row(conn: &Connection, reading: &Reading) -> rusqlite::Result<ReadingId> {
        conn.execute(
            "INSERT INTO readings (device_id, sensor_id, sensor_name, timestamp_ms, temperature, humidity,
                                   pressure, predicted_temperature, alarm, alarm_message, exported, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                reading.device_id,
                reading.sensor_id,
                reading.sensor_name,
                reading.timestamp.timestamp_millis(),
                reading.temperature,
                reading.humidity,
                reading.pressure,
                reading.predicted_temperature,
                reading.alarm,
                reading.alarm_message,
                reading.exported,
                reading.tier.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn conversion_error(column: usize, ty: Type, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(column, ty, msg.into())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn insert(&self, reading: Reading) -> AppResult<Reading> {
        self.run(move |conn| {
            let id = Self::insert_row(conn, &reading)?;
            Ok(Reading { id: Some(id), ..reading })
        })
        .await
    }

    async fn attach_enrichment(
        &self,
        id: ReadingId,
        predicted_temperature: Option<f64>,
        alarm: bool,
        alarm_message: Option<String>,
    ) -> AppResult<()> {
        let changed = self
            .run(move |conn| {
                conn.execute(
                    "UPDATE readings SET predicted_temperature = ?2, alarm = ?3, alarm_message = ?4 WHERE id = ?1",
                    params![id, predicted_temperature, alarm, alarm_message],
                )
            })
            .await?;
        if changed == 0 {
            return Err(GatewayError::Storage(format!("reading {id} not found")));
        }
        Ok(())
    }

    async fn mark_exported(&self, ids: &[ReadingId]) -> AppResult<usize> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare("UPDATE readings SET exported = 1 WHERE id = ?1 AND exported = 0")?;
                for id in &ids {
                    changed += stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn find_range(&self, query: &RangeQuery) -> AppResult<Vec<Reading>> {
        let query = query.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM readings
                 WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2
                   AND (?3 IS NULL OR sensor_id = ?3)
                   AND (?4 IS NULL OR tier = ?4)
                 ORDER BY timestamp_ms ASC, id ASC"
            ))?;
            let rows = stmt.query_map(
                params![
                    query.from.timestamp_millis(),
                    query.to.timestamp_millis(),
                    query.sensor_id,
                    query.tier.map(StorageTier::as_str),
                ],
                Self::row_to_reading,
            )?;
            rows.collect()
        })
        .await
    }

    async fn find_unexported(&self, limit: usize) -> AppResult<Vec<Reading>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM readings WHERE exported = 0 ORDER BY timestamp_ms ASC, id ASC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit_param(limit)], Self::row_to_reading)?;
            rows.collect()
        })
        .await
    }

    async fn find_unexported_alarms(&self, limit: usize) -> AppResult<Vec<Reading>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM readings WHERE exported = 0 AND alarm = 1
                 ORDER BY timestamp_ms ASC, id ASC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit_param(limit)], Self::row_to_reading)?;
            rows.collect()
        })
        .await
    }

    async fn find_alarms(&self, sensor_id: Option<&str>, limit: usize) -> AppResult<Vec<Reading>> {
        let sensor_id = sensor_id.map(str::to_owned);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM readings WHERE alarm = 1 AND (?1 IS NULL OR sensor_id = ?1)
                 ORDER BY timestamp_ms DESC, id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![sensor_id, limit_param(limit)], Self::row_to_reading)?;
            rows.collect()
        })
        .await
    }

    async fn latest(&self, sensor_id: &str, tier: StorageTier) -> AppResult<Option<Reading>> {
        let sensor_id = sensor_id.to_owned();
        self.run(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLUMNS} FROM readings WHERE sensor_id = ?1 AND tier = ?2
                     ORDER BY timestamp_ms DESC, id DESC LIMIT 1"
                ),
                params![sensor_id, tier.as_str()],
                Self::row_to_reading,
            )
            .optional()
        })
        .await
    }

    async fn commit_aggregation(&self, aggregates: Vec<Reading>, source_ids: Vec<ReadingId>) -> AppResult<usize> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for aggregate in &aggregates {
                Self::insert_row(&tx, aggregate)?;
            }
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM readings WHERE id = ?1 AND exported = 1")?;
                for id in &source_ids {
                    deleted += stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn delete_exported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize> {
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM readings WHERE tier = ?1 AND exported = 1 AND timestamp_ms < ?2",
                params![tier.as_str(), before.timestamp_millis()],
            )
        })
        .await
    }

    async fn count_unexported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE tier = ?1 AND exported = 0 AND timestamp_ms < ?2",
                params![tier.as_str(), before.timestamp_millis()],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| usize::try_from(count).unwrap_or_default())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Measurements;
    use chrono::{Duration, TimeZone};

    fn raw(sensor: &str, secs: i64, temperature: f64, humidity: Option<f64>) -> Reading {
        Reading::realtime(
            "edge",
            sensor,
            "Boiler",
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            Measurements {
                temperature,
                humidity,
                pressure: None,
            },
        )
    }

    #[tokio::test]
    async fn insert_and_read_back_preserves_absent_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = store.insert(raw("s1", 0, 21.5, None)).await.unwrap();
        assert!(stored.id.is_some());

        let latest = store.latest("s1", StorageTier::Realtime).await.unwrap().unwrap();
        assert_eq!(latest, stored);
        assert!(latest.humidity.is_none());
    }

    #[tokio::test]
    async fn range_filters_by_sensor_and_tier() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(raw("s1", 0, 20.0, Some(40.0))).await.unwrap();
        store.insert(raw("s2", 1, 20.0, None)).await.unwrap();
        let mut minutely = raw("s1", 2, 20.0, None);
        minutely.tier = StorageTier::Minutely;
        store.insert(minutely).await.unwrap();

        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let query = RangeQuery::new(from, from + Duration::minutes(1))
            .sensor("s1")
            .tier(StorageTier::Realtime);
        let rows = store.find_range(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].humidity, Some(40.0));

        let all = store.find_range(&RangeQuery::new(from, from + Duration::minutes(1))).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn aggregation_commit_deletes_only_exported_sources() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(raw("s1", 0, 20.0, None)).await.unwrap().id.unwrap();
        let b = store.insert(raw("s1", 1, 22.0, None)).await.unwrap().id.unwrap();
        assert_eq!(store.mark_exported(&[a]).await.unwrap(), 1);

        let mut aggregate = raw("s1", 0, 21.0, None);
        aggregate.tier = StorageTier::Minutely;
        let deleted = store.commit_aggregation(vec![aggregate], vec![a, b]).await.unwrap();
        assert_eq!(deleted, 1);

        let unexported = store.find_unexported(10).await.unwrap();
        assert_eq!(unexported.len(), 2);
        assert!(unexported.iter().any(|r| r.id == Some(b)));
        assert!(unexported.iter().any(|r| r.tier == StorageTier::Minutely));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("readings.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(raw("s1", 0, 20.0, None)).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.latest("s1", StorageTier::Realtime).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enrichment_of_missing_row_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.attach_enrichment(42, None, false, None).await.is_err());
    }
}
