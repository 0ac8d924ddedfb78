//! In-process reading store.

use super::{RangeQuery, ReadingStore};
use crate::error::{AppResult, GatewayError};
use crate::reading::{Reading, ReadingId, StorageTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Readings kept in a `BTreeMap` keyed by id, behind one lock.
///
/// A single write lock covers every multi-row mutation, which makes
/// [`ReadingStore::commit_aggregation`] atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: ReadingId,
    rows: BTreeMap<ReadingId, Reading>,
}

impl Inner {
    fn push(&mut self, mut reading: Reading) -> Reading {
        self.next_id += 1;
        reading.id = Some(self.next_id);
        self.rows.insert(self.next_id, reading.clone());
        reading
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row, in id order.
    pub fn all(&self) -> Vec<Reading> {
        self.inner.read().rows.values().cloned().collect()
    }

    fn select<F>(&self, filter: F) -> Vec<Reading>
    where
        F: Fn(&Reading) -> bool,
    {
        let mut rows: Vec<Reading> = self
            .inner
            .read()
            .rows
            .values()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        rows
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert(&self, reading: Reading) -> AppResult<Reading> {
        Ok(self.inner.write().push(reading))
    }

    async fn attach_enrichment(
        &self,
        id: ReadingId,
        predicted_temperature: Option<f64>,
        alarm: bool,
        alarm_message: Option<String>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| GatewayError::Storage(format!("reading {id} not found")))?;
        row.predicted_temperature = predicted_temperature;
        row.alarm = alarm;
        row.alarm_message = alarm_message;
        Ok(())
    }

    async fn mark_exported(&self, ids: &[ReadingId]) -> AppResult<usize> {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                if !row.exported {
                    row.exported = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn find_range(&self, query: &RangeQuery) -> AppResult<Vec<Reading>> {
        Ok(self.select(|r| query.matches(r)))
    }

    async fn find_unexported(&self, limit: usize) -> AppResult<Vec<Reading>> {
        let mut rows = self.select(|r| !r.exported);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_unexported_alarms(&self, limit: usize) -> AppResult<Vec<Reading>> {
        let mut rows = self.select(|r| !r.exported && r.alarm);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_alarms(&self, sensor_id: Option<&str>, limit: usize) -> AppResult<Vec<Reading>> {
        let mut rows = self.select(|r| r.alarm && sensor_id.map_or(true, |s| r.sensor_id == s));
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    async fn latest(&self, sensor_id: &str, tier: StorageTier) -> AppResult<Option<Reading>> {
        Ok(self
            .select(|r| r.sensor_id == sensor_id && r.tier == tier)
            .pop())
    }

    async fn commit_aggregation(&self, aggregates: Vec<Reading>, source_ids: Vec<ReadingId>) -> AppResult<usize> {
        let mut inner = self.inner.write();
        for aggregate in aggregates {
            inner.push(aggregate);
        }
        let mut deleted = 0;
        for id in source_ids {
            if inner.rows.get(&id).is_some_and(|r| r.exported) {
                inner.rows.remove(&id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_exported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize> {
        let mut inner = self.inner.write();
        let before_len = inner.rows.len();
        inner
            .rows
            .retain(|_, r| !(r.tier == tier && r.exported && r.timestamp < before));
        Ok(before_len - inner.rows.len())
    }

    async fn count_unexported_before(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<usize> {
        Ok(self
            .inner
            .read()
            .rows
            .values()
            .filter(|r| r.tier == tier && !r.exported && r.timestamp < before)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Measurements;
    use chrono::{Duration, TimeZone};

    fn raw(sensor: &str, secs: i64, temperature: f64) -> Reading {
        Reading::realtime(
            "edge",
            sensor,
            sensor,
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            Measurements {
                temperature,
                humidity: None,
                pressure: None,
            },
        )
    }

    #[tokio::test]
    async fn enrichment_does_not_touch_export_flag() {
        let store = MemoryStore::new();
        let row = store.insert(raw("s1", 0, 20.0)).await.unwrap();
        let id = row.id.unwrap();

        store.mark_exported(&[id]).await.unwrap();
        store
            .attach_enrichment(id, Some(19.0), true, Some("hot".into()))
            .await
            .unwrap();

        let stored = store.all().pop().unwrap();
        assert!(stored.exported);
        assert!(stored.alarm);
        assert_eq!(stored.predicted_temperature, Some(19.0));
    }

    #[tokio::test]
    async fn range_is_half_open() {
        let store = MemoryStore::new();
        for secs in [0, 10, 20] {
            store.insert(raw("s1", secs, 20.0)).await.unwrap();
        }
        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let rows = store
            .find_range(&RangeQuery::new(from, from + Duration::seconds(20)).sensor("s1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn commit_keeps_unexported_sources() {
        let store = MemoryStore::new();
        let a = store.insert(raw("s1", 0, 20.0)).await.unwrap().id.unwrap();
        let b = store.insert(raw("s1", 1, 22.0)).await.unwrap().id.unwrap();
        store.mark_exported(&[a]).await.unwrap();

        let deleted = store.commit_aggregation(vec![raw("s1", 0, 21.0)], vec![a, b]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(), 2);
        assert!(store.all().iter().any(|r| r.id == Some(b)));
    }

    #[tokio::test]
    async fn purge_only_removes_exported_rows() {
        let store = MemoryStore::new();
        let a = store.insert(raw("s1", 0, 20.0)).await.unwrap().id.unwrap();
        store.insert(raw("s1", 1, 20.0)).await.unwrap();
        store.mark_exported(&[a]).await.unwrap();

        let cutoff = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert_eq!(store.count_unexported_before(StorageTier::Realtime, cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_exported_before(StorageTier::Realtime, cutoff).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn alarms_are_newest_first() {
        let store = MemoryStore::new();
        for secs in [0, 5, 10] {
            let mut r = raw("s1", secs, 40.0);
            r.alarm = true;
            store.insert(r).await.unwrap();
        }
        let alarms = store.find_alarms(Some("s1"), 2).await.unwrap();
        assert_eq!(alarms.len(), 2);
        assert!(alarms[0].timestamp > alarms[1].timestamp);
    }
}
