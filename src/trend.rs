//! Forecast-based early warning.
//!
//! Every check sends each sensor's recent history, averaged into fixed steps,
//! to the trend forecaster. The first forecast point outside the sensor's
//! effective `[lower, upper]` band becomes a persisted `PREDICTED` alarm
//! Reading stamped at the forecast time, which is exported right away.

use crate::alarm::AlarmEvaluator;
use crate::config::{SensorDefinition, TrendConfig};
use crate::error::AppResult;
use crate::export::ExportPipeline;
use crate::prediction::{HistoryPoint, PredictionClient};
use crate::reading::{bucket_start, mean_of_present, Reading, StorageTier};
use crate::storage::{RangeQuery, ReadingStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct TrendMonitor {
    device_id: String,
    sensors: Vec<SensorDefinition>,
    store: Arc<dyn ReadingStore>,
    prediction: Arc<dyn PredictionClient>,
    alarms: Arc<AlarmEvaluator>,
    export: Option<Arc<ExportPipeline>>,
    config: TrendConfig,
}

impl TrendMonitor {
    pub fn new(
        device_id: impl Into<String>,
        sensors: Vec<SensorDefinition>,
        store: Arc<dyn ReadingStore>,
        prediction: Arc<dyn PredictionClient>,
        alarms: Arc<AlarmEvaluator>,
        export: Option<Arc<ExportPipeline>>,
        config: TrendConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sensors,
            store,
            prediction,
            alarms,
            export,
            config,
        }
    }

    fn step_secs(&self) -> i64 {
        i64::try_from(self.config.step_seconds.max(1)).unwrap_or(5)
    }

    /// History points a full window would hold.
    pub fn expected_points(&self) -> usize {
        let window = self.config.history_minutes.saturating_mul(60);
        usize::try_from(window / self.config.step_seconds.max(1)).unwrap_or(usize::MAX)
    }

    /// Check every sensor once. Returns the predictive alarms raised.
    pub async fn check_all(&self, now: DateTime<Utc>) -> Vec<Reading> {
        let mut raised = Vec::new();
        for sensor in &self.sensors {
            match self.check_sensor(sensor, now).await {
                Ok(Some(alarm)) => raised.push(alarm),
                Ok(None) => {}
                Err(e) => tracing::warn!(sensor = %sensor.id, error = %e, "Trend check failed"),
            }
        }
        raised
    }

    pub async fn check_sensor(&self, sensor: &SensorDefinition, now: DateTime<Utc>) -> AppResult<Option<Reading>> {
        let history = self.history(&sensor.id, now).await?;
        let required = (self.expected_points() as f64 * self.config.min_coverage).ceil() as usize;
        if history.len() < required {
            tracing::debug!(
                sensor = %sensor.id,
                points = history.len(),
                required,
                "Not enough history for a trend forecast"
            );
            return Ok(None);
        }

        let forecast = match self
            .prediction
            .predict_trend(&sensor.id, &history, self.config.horizon_seconds)
            .await
        {
            Ok(forecast) => forecast,
            Err(e) => {
                tracing::debug!(sensor = %sensor.id, error = %e, "No trend forecast available");
                return Ok(None);
            }
        };

        let band = self.alarms.thresholds(&sensor.id);
        let Some((step, value)) = forecast
            .iter()
            .copied()
            .enumerate()
            .find(|(_, value)| value.is_finite() && !band.contains(*value))
        else {
            return Ok(None);
        };

        let seconds_ahead = (step as i64 + 1) * self.step_secs();
        let message = self.alarms.predictive_message(&sensor.id, value, seconds_ahead);
        tracing::warn!(alarm = %message, "Predictive alarm raised");

        let alarm = Reading {
            id: None,
            device_id: self.device_id.clone(),
            sensor_id: sensor.id.clone(),
            sensor_name: sensor.name.clone(),
            timestamp: now + Duration::seconds(seconds_ahead),
            temperature: Some(value),
            humidity: None,
            pressure: None,
            predicted_temperature: Some(value),
            alarm: true,
            alarm_message: Some(message),
            exported: false,
            tier: StorageTier::Predicted,
        };
        let mut stored = self.store.insert(alarm).await?;
        if let Some(export) = &self.export {
            stored.exported = export.export_one(&stored).await;
        }
        Ok(Some(stored))
    }

    /// Recent `REALTIME` rows of `sensor_id`, averaged per step bucket.
    pub async fn history(&self, sensor_id: &str, now: DateTime<Utc>) -> AppResult<Vec<HistoryPoint>> {
        let window = Duration::minutes(i64::try_from(self.config.history_minutes).unwrap_or(i64::MAX / 60_000));
        let from = now - window - Duration::seconds(self.step_secs());
        let rows = self
            .store
            .find_range(
                &RangeQuery::new(from, now + Duration::milliseconds(1))
                    .sensor(sensor_id)
                    .tier(StorageTier::Realtime),
            )
            .await?;

        let mut buckets: BTreeMap<DateTime<Utc>, Vec<Reading>> = BTreeMap::new();
        for row in rows {
            buckets
                .entry(bucket_start(row.timestamp, self.step_secs()))
                .or_default()
                .push(row);
        }

        Ok(buckets
            .into_iter()
            .filter_map(|(timestamp, rows)| {
                Some(HistoryPoint {
                    timestamp,
                    temperature: mean_of_present(rows.iter().map(|r| r.temperature))?,
                    humidity: mean_of_present(rows.iter().map(|r| r.humidity)),
                    pressure: mean_of_present(rows.iter().map(|r| r.pressure)),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlarmConfig;
    use crate::reading::Measurements;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct ScriptedTrend {
        forecast: Vec<f64>,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl PredictionClient for ScriptedTrend {
        async fn predict_point(&self, _: f64, _: Option<f64>, _: Option<f64>) -> AppResult<Option<f64>> {
            Ok(None)
        }

        async fn predict_trend(&self, _: &str, history: &[HistoryPoint], _: u64) -> AppResult<Vec<f64>> {
            self.seen.lock().push(history.len());
            Ok(self.forecast.clone())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
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

    async fn fill(store: &MemoryStore, points: i64) {
        for i in 0..points {
            let reading = Reading::realtime(
                "edge",
                "s1",
                "Boiler",
                now() - Duration::seconds(5 * i + 1),
                Measurements {
                    temperature: 20.0,
                    humidity: None,
                    pressure: None,
                },
            );
            store.insert(reading).await.unwrap();
        }
    }

    fn monitor(store: Arc<MemoryStore>, forecast: Vec<f64>) -> (TrendMonitor, Arc<ScriptedTrend>) {
        let client = Arc::new(ScriptedTrend {
            forecast,
            seen: Mutex::new(Vec::new()),
        });
        let alarms = Arc::new(AlarmEvaluator::new(AlarmConfig::default(), HashMap::new()));
        let config = TrendConfig {
            history_minutes: 1,
            ..Default::default()
        };
        let monitor = TrendMonitor::new("edge", vec![sensor()], store, client.clone(), alarms, None, config);
        (monitor, client)
    }

    #[tokio::test]
    async fn history_averages_per_step() {
        let store = Arc::new(MemoryStore::new());
        for (secs, t) in [(1, 20.0), (2, 22.0), (6, 30.0)] {
            let reading = Reading::realtime(
                "edge",
                "s1",
                "Boiler",
                now() - Duration::seconds(10) + Duration::seconds(secs),
                Measurements {
                    temperature: t,
                    humidity: None,
                    pressure: None,
                },
            );
            store.insert(reading).await.unwrap();
        }
        let (monitor, _) = monitor(store, Vec::new());
        let history = monitor.history("s1", now()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].temperature, 21.0);
        assert_eq!(history[1].temperature, 30.0);
    }

    #[tokio::test]
    async fn sparse_history_is_not_forecast() {
        let store = Arc::new(MemoryStore::new());
        fill(&store, 5).await;
        let (monitor, client) = monitor(store, vec![50.0]);
        assert!(monitor.check_all(now()).await.is_empty());
        assert!(client.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn first_violation_raises_one_predicted_alarm() {
        let store = Arc::new(MemoryStore::new());
        fill(&store, 12).await;
        let (monitor, client) = monitor(store.clone(), vec![25.0, 31.0, 35.0]);

        let raised = monitor.check_all(now()).await;
        assert_eq!(raised.len(), 1);
        assert_eq!(client.seen.lock()[0], 12);

        let alarm = &raised[0];
        assert_eq!(alarm.tier, StorageTier::Predicted);
        assert_eq!(alarm.temperature, Some(31.0));
        assert_eq!(alarm.predicted_temperature, Some(31.0));
        assert_eq!(alarm.timestamp, now() + Duration::seconds(10));
        assert!(alarm.alarm);
        assert!(alarm.id.is_some());
        assert_eq!(
            store.all().iter().filter(|r| r.tier == StorageTier::Predicted).count(),
            1
        );
    }

    #[tokio::test]
    async fn forecast_inside_band_raises_nothing() {
        let store = Arc::new(MemoryStore::new());
        fill(&store, 12).await;
        let (monitor, _) = monitor(store, vec![20.0, 21.0]);
        assert!(monitor.check_all(now()).await.is_empty());
    }
}
