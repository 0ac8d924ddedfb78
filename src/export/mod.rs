//! Export of Readings to the remote store.
//!
//! Two cooperating paths share one pipeline:
//!
//! - **Fast path** ([`ExportPipeline::export_one`]): called right after a Reading
//!   has been enriched. One attempt, no retry; a failure only leaves the export
//!   flag false.
//! - **Sweep** ([`ExportPipeline::sweep`]): on a fixed period, gathers unexported
//!   alarm rows first and then unexported rows of every tier, de-duplicates by
//!   id, caps at the batch size and sends one batch. Success flips the flag for
//!   exactly that set; failure changes nothing.
//!
//! Both paths claim row ids in a shared in-flight set before sending. A sweep
//! skips rows the fast path holds. The fast path never skips: a sweep may have
//! fetched the row before its enrichment was attached, so the fast path waits
//! for that claim to be released and then sends its enriched copy. The remote
//! end is expected to treat `(sensorId, timestamp)` as the identity of a
//! Reading, which makes that second send harmless.

use crate::error::AppResult;
use crate::reading::{Reading, ReadingId};
use crate::storage::ReadingStore;
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

pub mod sink;

pub use sink::{ExportSink, HttpExportSink};

pub struct ExportPipeline {
    store: Arc<dyn ReadingStore>,
    sink: Arc<dyn ExportSink>,
    batch_size: usize,
    in_flight: DashSet<ReadingId>,
    released: Notify,
}

/// Ids claimed for sending; released on drop.
struct Claim<'a> {
    in_flight: &'a DashSet<ReadingId>,
    released: &'a Notify,
    ids: Vec<ReadingId>,
}

impl<'a> Claim<'a> {
    fn new(in_flight: &'a DashSet<ReadingId>, released: &'a Notify) -> Self {
        Self {
            in_flight,
            released,
            ids: Vec::new(),
        }
    }

    /// Claim `id`; false if another export already holds it.
    fn take(&mut self, id: ReadingId) -> bool {
        if self.in_flight.insert(id) {
            self.ids.push(id);
            true
        } else {
            false
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.in_flight.remove(id);
        }
        if !self.ids.is_empty() {
            self.released.notify_waiters();
        }
    }
}

impl ExportPipeline {
    pub fn new(store: Arc<dyn ReadingStore>, sink: Arc<dyn ExportSink>, batch_size: usize) -> Self {
        Self {
            store,
            sink,
            batch_size: batch_size.max(1),
            in_flight: DashSet::new(),
            released: Notify::new(),
        }
    }

    /// Push one Reading immediately. Returns whether it is now marked exported.
    pub async fn export_one(&self, reading: &Reading) -> bool {
        let Some(id) = reading.id else {
            tracing::warn!(sensor = %reading.sensor_id, "Cannot export a Reading that has not been stored");
            return false;
        };
        if reading.exported {
            return true;
        }

        let _claim = self.claim_one(id).await;
        if let Err(e) = self.sink.send_one(reading).await {
            tracing::warn!(
                id,
                sensor = %reading.sensor_id,
                error = %e,
                "Export failed, leaving Reading for the next sweep"
            );
            return false;
        }

        match self.store.mark_exported(&[id]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(id, error = %e, "Exported Reading could not be marked");
                false
            }
        }
    }

    /// Claim `id`, waiting for any other holder to release it first.
    async fn claim_one(&self, id: ReadingId) -> Claim<'_> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let mut claim = Claim::new(&self.in_flight, &self.released);
            if claim.take(id) {
                return claim;
            }
            tracing::debug!(id, "Reading is in a batch being sent, resending once it completes");
            released.await;
        }
    }

    /// Send everything still unexported, up to one batch. Returns the number of
    /// Readings marked exported.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> AppResult<usize> {
        let alarms = self.store.find_unexported_alarms(self.batch_size).await?;
        let pending = self.store.find_unexported(self.batch_size).await?;

        let mut claim = Claim::new(&self.in_flight, &self.released);
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(self.batch_size);
        for reading in alarms.into_iter().chain(pending) {
            if batch.len() >= self.batch_size {
                break;
            }
            let Some(id) = reading.id else { continue };
            if reading.exported || !seen.insert(id) {
                continue;
            }
            if claim.take(id) {
                batch.push(reading);
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.sink.send_batch(&batch).await {
            tracing::warn!(count = batch.len(), error = %e, "Batch export failed, will retry next sweep");
            return Ok(0);
        }

        let ids: Vec<ReadingId> = batch.iter().filter_map(|r| r.id).collect();
        let marked = self.store.mark_exported(&ids).await?;
        tracing::info!(count = marked, "Batch export succeeded");
        Ok(marked)
    }

    /// Number of ids currently claimed by an export attempt.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::reading::{Measurements, StorageTier};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        fail: AtomicBool,
        batches: Mutex<Vec<Vec<ReadingId>>>,
        singles: Mutex<Vec<ReadingId>>,
    }

    #[async_trait]
    impl ExportSink for RecordingSink {
        async fn send_one(&self, reading: &Reading) -> AppResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::Remote("offline".into()));
            }
            self.singles.lock().push(reading.id.unwrap_or_default());
            Ok(())
        }

        async fn send_batch(&self, readings: &[Reading]) -> AppResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::Remote("offline".into()));
            }
            self.batches.lock().push(readings.iter().filter_map(|r| r.id).collect());
            Ok(())
        }
    }

    fn reading(secs: i64, alarm: bool, tier: StorageTier) -> Reading {
        let mut r = Reading::realtime(
            "edge",
            "s1",
            "Boiler",
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            Measurements {
                temperature: 20.0,
                humidity: None,
                pressure: None,
            },
        );
        r.alarm = alarm;
        r.tier = tier;
        r
    }

    async fn setup(batch_size: usize) -> (Arc<MemoryStore>, Arc<RecordingSink>, ExportPipeline) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = ExportPipeline::new(store.clone(), sink.clone(), batch_size);
        (store, sink, pipeline)
    }

    #[tokio::test]
    async fn fast_path_marks_on_success() {
        let (store, sink, pipeline) = setup(10).await;
        let stored = store.insert(reading(0, false, StorageTier::Realtime)).await.unwrap();

        assert!(pipeline.export_one(&stored).await);
        assert!(store.all()[0].exported);
        assert_eq!(sink.singles.lock().len(), 1);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn sweep_puts_alarms_first_and_caps_batch() {
        let (store, sink, pipeline) = setup(2).await;
        store.insert(reading(0, false, StorageTier::Realtime)).await.unwrap();
        store.insert(reading(1, false, StorageTier::Minutely)).await.unwrap();
        let alarm = store.insert(reading(2, true, StorageTier::Realtime)).await.unwrap();

        assert_eq!(pipeline.sweep().await.unwrap(), 2);
        let batches = sink.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0], alarm.id.unwrap());
        assert_eq!(batches[0].len(), 2);

        assert_eq!(pipeline.sweep().await.unwrap(), 1);
        assert_eq!(pipeline.sweep().await.unwrap(), 0);
        assert!(store.all().iter().all(|r| r.exported));
    }

    #[tokio::test]
    async fn failed_sweep_changes_nothing() {
        let (store, sink, pipeline) = setup(10).await;
        store.insert(reading(0, false, StorageTier::Realtime)).await.unwrap();
        sink.fail.store(true, Ordering::SeqCst);

        assert_eq!(pipeline.sweep().await.unwrap(), 0);
        assert!(!store.all()[0].exported);
        assert_eq!(pipeline.in_flight(), 0);
    }

    /// Records full Readings; batches take two seconds.
    #[derive(Default)]
    struct SlowBatchSink {
        singles: Mutex<Vec<Reading>>,
        batches: Mutex<Vec<Vec<Reading>>>,
    }

    #[async_trait]
    impl ExportSink for SlowBatchSink {
        async fn send_one(&self, reading: &Reading) -> AppResult<()> {
            self.singles.lock().push(reading.clone());
            Ok(())
        }

        async fn send_batch(&self, readings: &[Reading]) -> AppResult<()> {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            self.batches.lock().push(readings.to_vec());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enrichment_during_sweep_is_still_exported() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(SlowBatchSink::default());
        let pipeline = Arc::new(ExportPipeline::new(store.clone(), sink.clone(), 10));
        let raw = store.insert(reading(0, false, StorageTier::Realtime)).await.unwrap();
        let id = raw.id.unwrap();

        let sweeper = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.sweep().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(pipeline.in_flight(), 1, "sweep holds the raw row");

        let message = Some("Sensor [Boiler (s1)] over temperature".to_string());
        store.attach_enrichment(id, None, true, message.clone()).await.unwrap();
        let mut enriched = raw.clone();
        enriched.alarm = true;
        enriched.alarm_message = message;
        assert!(pipeline.export_one(&enriched).await);

        assert_eq!(sweeper.await.unwrap().unwrap(), 1);
        assert!(!sink.batches.lock()[0][0].alarm);
        let singles = sink.singles.lock().clone();
        assert_eq!(singles.len(), 1);
        assert!(singles[0].alarm, "enriched copy reaches the remote");

        let stored = store.all().remove(0);
        assert!(stored.alarm && stored.exported);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn claimed_rows_are_skipped_by_sweep() {
        let (store, sink, pipeline) = setup(10).await;
        let a = store.insert(reading(0, false, StorageTier::Realtime)).await.unwrap();
        store.insert(reading(1, false, StorageTier::Realtime)).await.unwrap();

        let mut claim = Claim::new(&pipeline.in_flight, &pipeline.released);
        assert!(claim.take(a.id.unwrap()));
        assert_eq!(pipeline.sweep().await.unwrap(), 1);
        drop(claim);

        assert_eq!(sink.batches.lock()[0].len(), 1);
        assert!(pipeline.export_one(&store.all()[0]).await);
        assert!(store.all().iter().all(|r| r.exported));
    }
}
