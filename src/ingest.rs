//! From a decoded sample to a persisted, enriched and exported Reading.
//!
//! [`SampleIngestor::ingest`] runs on the polling path and only does the cheap
//! part: persist the raw `REALTIME` row, refresh the latest-reading cache and
//! queue the row for enrichment. Prediction, alarm evaluation and the export
//! fast path run on the [`EnrichmentPool`], a fixed set of workers draining a
//! bounded queue, so a slow remote call never delays a scheduler tick.

use crate::alarm::AlarmEvaluator;
use crate::config::{EnrichmentConfig, SensorDefinition};
use crate::error::AppResult;
use crate::export::ExportPipeline;
use crate::prediction::PredictionClient;
use crate::reading::{Measurements, Reading, StorageTier};
use crate::storage::{require_id, ReadingStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Newest Reading per sensor, for low-latency reads.
///
/// Not authoritative: compaction and export always go to the store.
#[derive(Default)]
pub struct LatestCache {
    entries: DashMap<String, Reading>,
}

impl LatestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `reading` unless the cache already holds a newer one for its sensor.
    pub fn update(&self, reading: &Reading) {
        self.entries
            .entry(reading.sensor_id.clone())
            .and_modify(|current| {
                if reading.timestamp >= current.timestamp {
                    *current = reading.clone();
                }
            })
            .or_insert_with(|| reading.clone());
    }

    pub fn get(&self, sensor_id: &str) -> Option<Reading> {
        self.entries.get(sensor_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all entries, ordered by sensor id.
    pub fn all(&self) -> Vec<Reading> {
        let mut all: Vec<Reading> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seed the cache from the newest stored `REALTIME` row of each sensor.
    pub async fn rebuild<'a, I>(&self, store: &dyn ReadingStore, sensor_ids: I) -> AppResult<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seeded = 0;
        for sensor_id in sensor_ids {
            if let Some(reading) = store.latest(sensor_id, StorageTier::Realtime).await? {
                self.update(&reading);
                seeded += 1;
            }
        }
        tracing::info!(count = seeded, "Latest-reading cache rebuilt");
        Ok(seeded)
    }
}

/// Prediction, alarm evaluation and fast-path export of one Reading.
pub struct Enricher {
    store: Arc<dyn ReadingStore>,
    alarms: Arc<AlarmEvaluator>,
    prediction: Option<Arc<dyn PredictionClient>>,
    export: Option<Arc<ExportPipeline>>,
    cache: Arc<LatestCache>,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        alarms: Arc<AlarmEvaluator>,
        prediction: Option<Arc<dyn PredictionClient>>,
        export: Option<Arc<ExportPipeline>>,
        cache: Arc<LatestCache>,
    ) -> Self {
        Self {
            store,
            alarms,
            prediction,
            export,
            cache,
        }
    }

    /// Enrich and persist `reading`, then try the export fast path.
    #[tracing::instrument(skip_all, fields(sensor = %reading.sensor_id, id = ?reading.id))]
    pub async fn enrich(&self, mut reading: Reading) -> AppResult<Reading> {
        let id = require_id(&reading)?;
        let Some(temperature) = reading.temperature else {
            return Ok(reading);
        };

        let predicted = match &self.prediction {
            Some(client) => match client
                .predict_point(temperature, reading.humidity, reading.pressure)
                .await
            {
                Ok(predicted) => predicted,
                Err(e) => {
                    tracing::debug!(error = %e, "No prediction available");
                    None
                }
            },
            None => None,
        };

        let verdict = self.alarms.evaluate(&reading.sensor_id, temperature, predicted);
        if verdict.triggered() {
            tracing::warn!(alarm = %verdict.message, "Alarm raised");
        }

        reading.predicted_temperature = predicted;
        reading.alarm = verdict.triggered();
        reading.alarm_message = Some(verdict.message);
        self.store
            .attach_enrichment(id, reading.predicted_temperature, reading.alarm, reading.alarm_message.clone())
            .await?;
        self.cache.update(&reading);

        if let Some(export) = &self.export {
            reading.exported = export.export_one(&reading).await;
        }
        Ok(reading)
    }
}

/// Bounded queue drained by a fixed number of enrichment workers.
pub struct EnrichmentPool {
    sender: Mutex<Option<mpsc::Sender<Reading>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EnrichmentPool {
    pub fn start(enricher: Arc<Enricher>, config: &EnrichmentConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Reading>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let enricher = Arc::clone(&enricher);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(reading) = next else { break };
                        if let Err(e) = enricher.enrich(reading).await {
                            tracing::warn!(worker, error = %e, "Enrichment failed, Reading kept without it");
                        }
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue `reading` without waiting. Returns false when the queue is full or
    /// closed; the Reading then stays raw and is picked up by the export sweep.
    pub fn submit(&self, reading: Reading) -> bool {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return false;
        };
        match sender.try_send(reading) {
            Ok(()) => true,
            Err(TrySendError::Full(reading)) => {
                tracing::warn!(sensor = %reading.sensor_id, "Enrichment queue full, skipping enrichment");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting work and wait for queued Readings to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for (index, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                tracing::warn!(worker = index, error = %e, "Enrichment worker ended abnormally");
            }
        }
    }
}

/// Turns decoded samples into persisted `REALTIME` Readings.
pub struct SampleIngestor {
    device_id: String,
    store: Arc<dyn ReadingStore>,
    cache: Arc<LatestCache>,
    enrichment: Option<Arc<EnrichmentPool>>,
}

impl SampleIngestor {
    pub fn new(
        device_id: impl Into<String>,
        store: Arc<dyn ReadingStore>,
        cache: Arc<LatestCache>,
        enrichment: Option<Arc<EnrichmentPool>>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            cache,
            enrichment,
        }
    }

    /// Persist one sample and hand it to enrichment.
    pub async fn ingest(
        &self,
        sensor: &SensorDefinition,
        timestamp: DateTime<Utc>,
        measurements: Measurements,
    ) -> AppResult<Reading> {
        let reading = Reading::realtime(&self.device_id, &sensor.id, &sensor.name, timestamp, measurements);
        let stored = self.store.insert(reading).await?;
        self.cache.update(&stored);
        tracing::debug!(
            sensor = %sensor.id,
            temperature = measurements.temperature,
            humidity = ?measurements.humidity,
            pressure = ?measurements.pressure,
            "Sample stored"
        );
        if let Some(pool) = &self.enrichment {
            pool.submit(stored.clone());
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlarmConfig;
    use crate::error::GatewayError;
    use crate::prediction::HistoryPoint;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct FixedPrediction(Option<f64>);

    #[async_trait]
    impl PredictionClient for FixedPrediction {
        async fn predict_point(&self, _: f64, _: Option<f64>, _: Option<f64>) -> AppResult<Option<f64>> {
            self.0.ok_or_else(|| GatewayError::Remote("down".into())).map(Some)
        }

        async fn predict_trend(&self, _: &str, _: &[HistoryPoint], _: u64) -> AppResult<Vec<f64>> {
            Ok(Vec::new())
        }
    }

    struct CrashingPrediction;

    #[async_trait]
    impl PredictionClient for CrashingPrediction {
        async fn predict_point(&self, _: f64, _: Option<f64>, _: Option<f64>) -> AppResult<Option<f64>> {
            panic!("prediction backend crashed")
        }

        async fn predict_trend(&self, _: &str, _: &[HistoryPoint], _: u64) -> AppResult<Vec<f64>> {
            Ok(Vec::new())
        }
    }

    fn sensor() -> SensorDefinition {
        SensorDefinition {
            id: "s1".into(),
            name: "Boiler".into(),
            connection: "bus0".into(),
            unit: 1,
            temperature: None,
            humidity: None,
            pressure: None,
            poll_interval_ms: None,
        }
    }

    fn sample(temperature: f64) -> Measurements {
        Measurements {
            temperature,
            humidity: Some(40.0),
            pressure: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn enricher(store: Arc<MemoryStore>, cache: Arc<LatestCache>, prediction: Option<f64>) -> Enricher {
        let alarms = Arc::new(AlarmEvaluator::new(AlarmConfig::default(), HashMap::new()));
        Enricher::new(
            store,
            alarms,
            Some(Arc::new(FixedPrediction(prediction))),
            None,
            cache,
        )
    }

    #[tokio::test]
    async fn ingest_persists_raw_row_and_updates_cache() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LatestCache::new());
        let ingestor = SampleIngestor::new("edge", store.clone(), cache.clone(), None);

        let stored = ingestor.ingest(&sensor(), at(0), sample(21.0)).await.unwrap();
        assert_eq!(stored.tier, StorageTier::Realtime);
        assert!(!stored.exported);
        assert!(stored.predicted_temperature.is_none());
        assert_eq!(cache.get("s1").unwrap().id, stored.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn enrichment_attaches_prediction_and_alarm() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LatestCache::new());
        let stored = store
            .insert(Reading::realtime("edge", "s1", "Boiler", at(0), sample(12.0)))
            .await
            .unwrap();

        let enriched = enricher(store.clone(), cache.clone(), Some(9.5)).enrich(stored).await.unwrap();
        assert!(enriched.alarm);
        let row = store.all().pop().unwrap();
        assert_eq!(row.predicted_temperature, Some(9.5));
        assert!(row.alarm);
        assert!(cache.get("s1").unwrap().alarm);
    }

    #[tokio::test]
    async fn prediction_failure_still_evaluates_thresholds() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LatestCache::new());
        let stored = store
            .insert(Reading::realtime("edge", "s1", "Boiler", at(0), sample(20.0)))
            .await
            .unwrap();

        let enriched = enricher(store.clone(), cache, None).enrich(stored).await.unwrap();
        assert!(!enriched.alarm);
        assert!(enriched.predicted_temperature.is_none());
        assert_eq!(enriched.alarm_message.as_deref(), Some("No Alarm"));
    }

    #[tokio::test]
    async fn cache_keeps_newest_reading() {
        let cache = LatestCache::new();
        let newer = Reading::realtime("edge", "s1", "Boiler", at(10), sample(21.0));
        let older = Reading::realtime("edge", "s1", "Boiler", at(0), sample(20.0));
        cache.update(&newer);
        cache.update(&older);
        assert_eq!(cache.get("s1").unwrap().timestamp, at(10));
    }

    #[tokio::test]
    async fn cache_rebuilds_from_store() {
        let store = MemoryStore::new();
        store
            .insert(Reading::realtime("edge", "s1", "Boiler", at(0), sample(20.0)))
            .await
            .unwrap();
        store
            .insert(Reading::realtime("edge", "s1", "Boiler", at(5), sample(21.0)))
            .await
            .unwrap();

        let cache = LatestCache::new();
        assert_eq!(cache.rebuild(&store, ["s1", "s2"]).await.unwrap(), 1);
        assert_eq!(cache.get("s1").unwrap().temperature, Some(21.0));
    }

    #[tokio::test]
    async fn pool_drains_queue_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LatestCache::new());
        let pool = Arc::new(EnrichmentPool::start(
            Arc::new(enricher(store.clone(), cache.clone(), Some(20.0))),
            &EnrichmentConfig {
                workers: 2,
                queue_capacity: 8,
            },
        ));
        let ingestor = SampleIngestor::new("edge", store.clone(), cache, Some(pool.clone()));
        for i in 0..4 {
            ingestor.ingest(&sensor(), at(i), sample(20.0)).await.unwrap();
        }
        pool.shutdown().await;

        assert!(store.all().iter().all(|r| r.alarm_message.is_some()));
        assert!(!pool.submit(Reading::realtime("edge", "s1", "Boiler", at(9), sample(20.0))));
    }

    #[tokio::test]
    async fn shutdown_survives_a_panicked_worker() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LatestCache::new());
        let alarms = Arc::new(AlarmEvaluator::new(AlarmConfig::default(), HashMap::new()));
        let enricher = Enricher::new(store.clone(), alarms, Some(Arc::new(CrashingPrediction)), None, cache);
        let pool = EnrichmentPool::start(
            Arc::new(enricher),
            &EnrichmentConfig {
                workers: 1,
                queue_capacity: 4,
            },
        );
        let stored = store
            .insert(Reading::realtime("edge", "s1", "Boiler", at(0), sample(20.0)))
            .await
            .unwrap();
        assert!(pool.submit(stored));

        pool.shutdown().await;
        assert!(store.all()[0].alarm_message.is_none());
        assert!(!pool.submit(Reading::realtime("edge", "s1", "Boiler", at(1), sample(20.0))));
    }
}
