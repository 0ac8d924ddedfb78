//! Remote runtime configuration.
//!
//! The cloud side publishes one JSON document per device carrying alarm
//! threshold overrides and per-sensor poll intervals. [`ConfigSync`] fetches it
//! periodically and applies it to the [`AlarmEvaluator`] and the
//! [`PollingSupervisor`]. A failed fetch or an unparseable payload changes
//! nothing: the last applied state stays in force until the next good fetch.

use crate::alarm::{AlarmEvaluator, ThresholdOverride};
use crate::config::ConfigSyncConfig;
use crate::error::{AppResult, GatewayError};
use crate::polling::PollingSupervisor;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Device configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConfig {
    pub device_id: Option<String>,
    pub last_updated: Option<String>,
    pub alarm_thresholds: Option<ThresholdOverride>,
    pub sensor_configs: Option<Vec<SensorRuntimeConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRuntimeConfig {
    pub sensor_id: String,
    pub alarm_thresholds: Option<ThresholdOverride>,
    pub poll_interval_ms: Option<u64>,
}

/// Where the configuration document comes from. `Ok(None)` is an empty document.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> AppResult<Option<EdgeConfig>>;
}

pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
}

impl HttpConfigSource {
    pub fn new(config: &ConfigSyncConfig, device_id: &str) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url_for(device_id),
        })
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> AppResult<Option<EdgeConfig>> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Remote(format!("{} answered {status}", self.url)));
        }
        parse_document(&response.text().await?)
    }
}

/// Parse a configuration document; an empty body or `null` is `None`.
pub fn parse_document(body: &str) -> AppResult<Option<EdgeConfig>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body).map_err(|e| GatewayError::Remote(format!("invalid configuration document: {e}")))
}

pub struct ConfigSync {
    source: Arc<dyn ConfigSource>,
    alarms: Arc<AlarmEvaluator>,
    polling: Option<Arc<PollingSupervisor>>,
    sensor_ids: Vec<String>,
    current: RwLock<Option<EdgeConfig>>,
}

impl ConfigSync {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        alarms: Arc<AlarmEvaluator>,
        polling: Option<Arc<PollingSupervisor>>,
        sensor_ids: Vec<String>,
    ) -> Self {
        Self {
            source,
            alarms,
            polling,
            sensor_ids,
            current: RwLock::new(None),
        }
    }

    /// Last successfully applied document.
    pub fn current(&self) -> Option<EdgeConfig> {
        self.current.read().clone()
    }

    /// Fetch and apply once. On error nothing changes.
    pub async fn sync(&self) -> AppResult<()> {
        match self.source.fetch().await {
            Ok(document) => {
                self.apply(document);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Configuration sync failed, keeping current settings");
                Err(e)
            }
        }
    }

    /// Apply `document` to thresholds and poll intervals.
    pub fn apply(&self, document: Option<EdgeConfig>) {
        let Some(document) = document else {
            tracing::info!("Empty configuration document, clearing threshold overrides");
            self.alarms.replace(None, HashMap::new());
            return;
        };

        let mut thresholds = HashMap::new();
        let mut intervals = HashMap::new();
        if let Some(sensor_configs) = &document.sensor_configs {
            for sensor_id in &self.sensor_ids {
                let Some(runtime) = sensor_configs.iter().find(|c| &c.sensor_id == sensor_id) else {
                    continue;
                };
                if let Some(t) = runtime.alarm_thresholds {
                    thresholds.insert(sensor_id.clone(), t);
                }
                if let Some(ms) = runtime.poll_interval_ms.filter(|ms| *ms > 0) {
                    intervals.insert(sensor_id.clone(), Duration::from_millis(ms));
                }
            }
        }

        self.alarms.replace(document.alarm_thresholds, thresholds);
        if let Some(polling) = &self.polling {
            polling.update_intervals(intervals);
        }
        tracing::info!(last_updated = ?document.last_updated, "Configuration applied");
        *self.current.write() = Some(document);
    }
}
