//! Persistence of Readings.
//!
//! The store is the system of record for everything the gateway does after a
//! sample has been taken: compaction, export and the read-side queries all work
//! from it. Two backends implement [`ReadingStore`]:
//!
//! - [`MemoryStore`]: process-local, the default and what the tests use
//! - `SqliteStore`: one `readings` table in a SQLite file (`storage_sqlite` feature)

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AppResult, GatewayError};
use crate::reading::{Reading, ReadingId, StorageTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod memory;
#[cfg(feature = "storage_sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "storage_sqlite")]
pub use sqlite::SqliteStore;

/// Half-open time range `[from, to)` filter, optionally narrowed to one
/// sensor and one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub sensor_id: Option<String>,
    pub tier: Option<StorageTier>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl RangeQuery {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            sensor_id: None,
            tier: None,
            from,
            to,
        }
    }

    pub fn sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.sensor_id = Some(sensor_id.into());
        self
    }

    pub fn tier(mut self, tier: StorageTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        reading.timestamp >= self.from
            && reading.timestamp < self.to
            && self.tier.map_or(true, |tier| reading.tier == tier)
            && self
                .sensor_id
                .as_deref()
                .map_or(true, |sensor| reading.sensor_id == sensor)
    }
}

/// A queryable, mutable table of Readings.
///
/// Updates are narrow on purpose: enrichment only touches the prediction and
/// alarm columns and export only flips the export flag, so the two can run
/// concurrently against the same row without overwriting each other.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Persist a new row and return it with its assigned id.
    async fn insert(&self, reading: Reading) -> AppResult<Reading>;

    /// Set the prediction and alarm columns of one row.
    async fn attach_enrichment(
        &self,
        id: ReadingId,
        predicted_temperature: Option<f64>,
        alarm: bool,
        alarm_message: Option<String>,
    ) -> AppResult<()>;

    /// Flip the export flag to true for `ids`. Returns the number of rows changed.
    async fn mark_exported(&self, ids: &[ReadingId]) -> AppResult<usize>;

    /// Rows matching `query`, oldest first.
    async fn find_range(&self, query: &RangeQuery) -> AppResult<Vec<Reading>>;

    /// Unexported rows of every tier, oldest first.
    async fn find_unexported(&self, limit: usize) -> AppResult<Vec<Reading>>;

    /// Unexported alarm rows of every tier, oldest first.
    async fn find_unexported_alarms(&self, limit: usize) -> AppResult<Vec<Reading>>;

    /// Alarm rows, newest first.
    async fn find_alarms(&self, sensor_id: Option<&str>, limit: usize) -> AppResult<Vec<Reading>>;

    /// Newest row of `sensor_id` in `tier`.
    async fn latest(&self, sensor_id: &str, tier: StorageTier) -> AppResult<Option<Reading>>;

    /// Write `aggregates` and delete the exported rows among `source_ids` as one unit.
    ///
    /// Source rows whose export flag is still false are left in place. Returns
    /// the number of rows deleted.
    async fn commit_aggregation(&self, aggregates: Vec<Reading>, source_ids: Vec<ReadingId>) -> AppResult<usize>;

    /// Delete exported rows of `tier` older than `before`.
    async fn delete_exported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize>;

    /// Count unexported rows of `tier` older than `before`.
    async fn count_unexported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize>;
}

/// Build the configured backend.
pub fn open_store(config: &StorageConfig) -> AppResult<Arc<dyn ReadingStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "storage_sqlite")]
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
        #[cfg(not(feature = "storage_sqlite"))]
        StorageBackend::Sqlite => Err(GatewayError::FeatureNotEnabled("storage_sqlite".into())),
    }
}

/// Guard against rows without an id reaching id-based operations.
pub(crate) fn require_id(reading: &Reading) -> AppResult<ReadingId> {
    reading
        .id
        .ok_or_else(|| GatewayError::Storage(format!("reading of sensor {} has no id", reading.sensor_id)))
}
