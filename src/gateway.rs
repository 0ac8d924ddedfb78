//! Assembly of the running gateway.
//!
//! [`GatewayBuilder`] wires every component from a [`GatewayConfig`]. Each
//! external boundary (store, export sink, forecaster, config source, serial
//! transports) can be replaced before [`GatewayBuilder::start`], which is how
//! the integration tests run a full gateway without hardware or network.
//!
//! The started [`Gateway`] owns the background tasks and exposes the
//! read-side queries and runtime updates an HTTP layer would call.

use crate::alarm::{AlarmEvaluator, EffectiveThresholds, ThresholdOverride};
use crate::compaction::{CompactionEngine, CompactionReport};
use crate::config::{GatewayConfig, SensorDefinition};
use crate::config_sync::{ConfigSource, ConfigSync, EdgeConfig, HttpConfigSource};
use crate::error::{AppResult, GatewayError};
use crate::export::{ExportPipeline, ExportSink, HttpExportSink};
use crate::hardware::BusTransport;
use crate::ingest::{Enricher, EnrichmentPool, LatestCache, SampleIngestor};
use crate::periodic::{spawn_periodic, spawn_periodic_at, TaskHandle};
use crate::polling::PollingSupervisor;
use crate::prediction::{HttpPredictionClient, PredictionClient};
use crate::reading::{Reading, StorageTier};
use crate::storage::{open_store, RangeQuery, ReadingStore};
use crate::trend::TrendMonitor;
use chrono::{DateTime, Duration as Age, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Builds a [`Gateway`], optionally with replaced boundaries.
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn ReadingStore>>,
    export_sink: Option<Arc<dyn ExportSink>>,
    prediction: Option<Arc<dyn PredictionClient>>,
    config_source: Option<Arc<dyn ConfigSource>>,
    transports: Option<Vec<Arc<BusTransport>>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            export_sink: None,
            prediction: None,
            config_source: None,
            transports: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ReadingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn export_sink(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.export_sink = Some(sink);
        self
    }

    pub fn prediction(mut self, client: Arc<dyn PredictionClient>) -> Self {
        self.prediction = Some(client);
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    /// Use these already-open transports instead of opening serial ports.
    pub fn transports(mut self, transports: Vec<Arc<BusTransport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Validate the configuration, wire every component and start the tasks.
    pub async fn start(self) -> AppResult<Gateway> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.storage)?,
        };

        let sensor_names = config
            .serial
            .sensors
            .iter()
            .map(|s| (s.id.clone(), s.name.clone()))
            .collect::<HashMap<_, _>>();
        let alarms = Arc::new(AlarmEvaluator::new(config.alarm, sensor_names));

        let cache = Arc::new(LatestCache::new());
        if let Err(e) = cache
            .rebuild(store.as_ref(), config.serial.sensors.iter().map(|s| s.id.as_str()))
            .await
        {
            tracing::warn!(error = %e, "Could not rebuild latest-reading cache, starting cold");
        }

        let export = if config.export.enabled {
            let sink: Arc<dyn ExportSink> = match self.export_sink {
                Some(sink) => sink,
                None => Arc::new(HttpExportSink::new(&config.export)?),
            };
            Some(Arc::new(ExportPipeline::new(
                Arc::clone(&store),
                sink,
                config.export.batch_size,
            )))
        } else {
            None
        };

        let prediction: Option<Arc<dyn PredictionClient>> = if config.prediction.enabled {
            match self.prediction {
                Some(client) => Some(client),
                None => Some(Arc::new(HttpPredictionClient::new(&config.prediction)?) as Arc<dyn PredictionClient>),
            }
        } else {
            None
        };

        let enricher = Arc::new(Enricher::new(
            Arc::clone(&store),
            Arc::clone(&alarms),
            prediction.clone(),
            export.clone(),
            Arc::clone(&cache),
        ));
        let enrichment = Arc::new(EnrichmentPool::start(enricher, &config.enrichment));
        let ingestor = Arc::new(SampleIngestor::new(
            &config.application.device_id,
            Arc::clone(&store),
            Arc::clone(&cache),
            Some(Arc::clone(&enrichment)),
        ));

        let transports = match self.transports {
            Some(transports) => transports,
            None => PollingSupervisor::open_transports(&config).await,
        };
        let polling = Arc::new(PollingSupervisor::start(transports, &config, ingestor));

        let mut tasks = Vec::new();

        let config_sync = if config.config_sync.enabled {
            let source: Arc<dyn ConfigSource> = match self.config_source {
                Some(source) => source,
                None => Arc::new(HttpConfigSource::new(&config.config_sync, &config.application.device_id)?),
            };
            let sync = Arc::new(ConfigSync::new(
                source,
                Arc::clone(&alarms),
                Some(Arc::clone(&polling)),
                config.serial.sensors.iter().map(|s| s.id.clone()).collect(),
            ));
            // failure is already logged and leaves the static defaults in force
            let _ = sync.sync().await;

            let period = Duration::from_millis(config.config_sync.interval_ms);
            let task_sync = Arc::clone(&sync);
            tasks.push(spawn_periodic_at(
                "config-sync",
                period,
                tokio::time::Instant::now() + period,
                move || {
                    let sync = Arc::clone(&task_sync);
                    async move {
                        let _ = sync.sync().await;
                    }
                },
            ));
            Some(sync)
        } else {
            None
        };

        if let Some(export) = &export {
            let export = Arc::clone(export);
            tasks.push(spawn_periodic(
                "export-sweep",
                Duration::from_millis(config.export.sweep_interval_ms),
                move || {
                    let export = Arc::clone(&export);
                    async move {
                        if let Err(e) = export.sweep().await {
                            tracing::warn!(error = %e, "Export sweep failed");
                        }
                    }
                },
            ));
        }

        let compaction = Arc::new(CompactionEngine::new(Arc::clone(&store), config.retention.clone()));
        if config.compaction.enabled {
            let engine = Arc::clone(&compaction);
            tasks.push(spawn_periodic(
                "compaction",
                Duration::from_secs(config.compaction.interval_secs),
                move || {
                    let engine = Arc::clone(&engine);
                    async move {
                        engine.run_pass(Utc::now()).await;
                    }
                },
            ));
        }

        if let Some(client) = prediction.filter(|_| config.prediction.trend.enabled) {
            let monitor = Arc::new(TrendMonitor::new(
                &config.application.device_id,
                config.serial.sensors.clone(),
                Arc::clone(&store),
                client,
                Arc::clone(&alarms),
                export.clone(),
                config.prediction.trend.clone(),
            ));
            tasks.push(spawn_periodic(
                "trend",
                Duration::from_millis(config.prediction.trend.interval_ms),
                move || {
                    let monitor = Arc::clone(&monitor);
                    async move {
                        monitor.check_all(Utc::now()).await;
                    }
                },
            ));
        }

        tracing::info!(
            device = %config.application.device_id,
            connections = polling.connections().len(),
            sensors = config.serial.sensors.len(),
            tasks = tasks.len(),
            "Gateway started"
        );

        Ok(Gateway {
            config,
            store,
            cache,
            alarms,
            export,
            enrichment,
            polling,
            compaction,
            config_sync,
            tasks,
        })
    }
}

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn ReadingStore>,
    cache: Arc<LatestCache>,
    alarms: Arc<AlarmEvaluator>,
    export: Option<Arc<ExportPipeline>>,
    enrichment: Arc<EnrichmentPool>,
    polling: Arc<PollingSupervisor>,
    compaction: Arc<CompactionEngine>,
    config_sync: Option<Arc<ConfigSync>>,
    tasks: Vec<TaskHandle>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ReadingStore> {
        &self.store
    }

    /// Configured sensors, in configuration order.
    pub fn sensors(&self) -> &[SensorDefinition] {
        &self.config.serial.sensors
    }

    pub fn default_poll_interval(&self) -> Duration {
        self.config.default_poll_interval()
    }

    pub fn poll_interval(&self, sensor_id: &str) -> AppResult<Duration> {
        self.require_sensor(sensor_id)?;
        Ok(self.polling.interval_for(sensor_id))
    }

    pub fn connections(&self) -> Vec<String> {
        self.polling.connections()
    }

    /// Newest Reading of one sensor.
    pub fn latest(&self, sensor_id: &str) -> Option<Reading> {
        self.cache.get(sensor_id)
    }

    /// Newest Reading of every sensor that has one.
    pub fn latest_all(&self) -> Vec<Reading> {
        self.cache.all()
    }

    /// Up to `limit` recent Readings, newest first, assembled from each tier's
    /// own window.
    pub async fn recent(&self, sensor_id: Option<&str>, limit: usize, now: DateTime<Utc>) -> AppResult<Vec<Reading>> {
        let retention = &self.config.retention;
        let windows = [
            (StorageTier::Realtime, now - retention.realtime(), now + Age::milliseconds(1)),
            (StorageTier::Minutely, now - retention.minutely(), now - retention.realtime()),
            (StorageTier::Hourly, now - retention.hourly(), now - retention.minutely()),
        ];

        let mut readings = Vec::new();
        for (tier, from, to) in windows {
            let mut query = RangeQuery::new(from, to).tier(tier);
            if let Some(sensor_id) = sensor_id {
                query = query.sensor(sensor_id);
            }
            readings.extend(self.store.find_range(&query).await?);
        }

        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut seen = HashSet::new();
        readings.retain(|r| r.id.map_or(true, |id| seen.insert(id)));
        readings.truncate(limit);
        Ok(readings)
    }

    /// Up to `limit` alarm Readings, newest first.
    pub async fn alarms(&self, sensor_id: Option<&str>, limit: usize) -> AppResult<Vec<Reading>> {
        self.store.find_alarms(sensor_id, limit).await
    }

    /// Readings of one sensor in `[from, to)`, any tier, oldest first.
    pub async fn range(&self, sensor_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> AppResult<Vec<Reading>> {
        self.store
            .find_range(&RangeQuery::new(from, to).sensor(sensor_id))
            .await
    }

    pub fn thresholds(&self, sensor_id: &str) -> EffectiveThresholds {
        self.alarms.thresholds(sensor_id)
    }

    pub fn set_global_thresholds(&self, thresholds: Option<ThresholdOverride>) {
        self.alarms.set_global(thresholds);
    }

    pub fn set_sensor_thresholds(&self, sensor_id: &str, thresholds: Option<ThresholdOverride>) -> AppResult<()> {
        self.require_sensor(sensor_id)?;
        self.alarms.set_sensor(sensor_id, thresholds);
        Ok(())
    }

    /// Set or clear the poll interval override of one sensor.
    pub fn set_poll_interval(&self, sensor_id: &str, interval: Option<Duration>) -> AppResult<()> {
        self.require_sensor(sensor_id)?;
        if interval.is_some_and(|i| i.is_zero()) {
            return Err(GatewayError::Configuration("poll interval must be greater than 0".into()));
        }
        self.polling.set_interval(sensor_id, interval);
        Ok(())
    }

    /// Current tick period of a connection.
    pub fn tick_period(&self, connection: &str) -> Option<Duration> {
        self.polling.tick_period(connection)
    }

    /// Last applied remote configuration.
    pub fn remote_config(&self) -> Option<EdgeConfig> {
        self.config_sync.as_ref().and_then(|sync| sync.current())
    }

    /// Run one export sweep now.
    pub async fn sweep_now(&self) -> AppResult<usize> {
        match &self.export {
            Some(export) => export.sweep().await,
            None => Ok(0),
        }
    }

    /// Run one compaction pass now.
    pub async fn compact_now(&self, now: DateTime<Utc>) -> CompactionReport {
        self.compaction.run_pass(now).await
    }

    /// Fetch the remote configuration now.
    pub async fn sync_config_now(&self) -> AppResult<()> {
        match &self.config_sync {
            Some(sync) => sync.sync().await,
            None => Ok(()),
        }
    }

    /// Stop polling, drain enrichment, then stop the background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Gateway shutting down");
        self.polling.shutdown().await;
        self.enrichment.shutdown().await;
        for task in &self.tasks {
            task.shutdown().await;
        }
        tracing::info!("Gateway stopped");
    }

    fn require_sensor(&self, sensor_id: &str) -> AppResult<()> {
        if self.sensors().iter().any(|s| s.id == sensor_id) {
            Ok(())
        } else {
            Err(GatewayError::UnknownSensor(sensor_id.to_string()))
        }
    }
}
