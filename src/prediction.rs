//! Client for the remote temperature forecaster.
//!
//! The model itself is opaque; the gateway only knows two JSON endpoints. Any
//! failure (transport, timeout, non-2xx, missing field) means "no prediction
//! available" to callers, which log and carry on without one.

use crate::config::PredictionConfig;
use crate::error::{AppResult, GatewayError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One history point sent with a trend request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

#[async_trait]
pub trait PredictionClient: Send + Sync {
    /// Predicted temperature for the current conditions.
    async fn predict_point(
        &self,
        temperature: f64,
        humidity: Option<f64>,
        pressure: Option<f64>,
    ) -> AppResult<Option<f64>>;

    /// Forecast temperatures at fixed steps after the last history point.
    async fn predict_trend(
        &self,
        sensor_id: &str,
        history: &[HistoryPoint],
        horizon_seconds: u64,
    ) -> AppResult<Vec<f64>>;
}

#[derive(Serialize)]
struct PointRequest {
    temperature: f64,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Deserialize)]
struct PointResponse {
    predicted_temperature: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrendRequest<'a> {
    sensor_id: &'a str,
    history_data: &'a [HistoryPoint],
    predict_horizon_seconds: u64,
}

#[derive(Deserialize)]
struct TrendResponse {
    #[serde(default)]
    forecast_temperatures: Vec<f64>,
}

/// [`PredictionClient`] over HTTP/JSON.
pub struct HttpPredictionClient {
    client: reqwest::Client,
    point_url: String,
    trend_url: String,
}

impl HttpPredictionClient {
    pub fn new(config: &PredictionConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            point_url: config.point_url.clone(),
            trend_url: config.trend_url.clone(),
        })
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> AppResult<R>
    where
        B: Serialize + Sync + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Remote(format!("{url} answered {status}")));
        }
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict_point(
        &self,
        temperature: f64,
        humidity: Option<f64>,
        pressure: Option<f64>,
    ) -> AppResult<Option<f64>> {
        let request = PointRequest {
            temperature,
            humidity,
            pressure,
        };
        let response: PointResponse = self.post(&self.point_url, &request).await?;
        Ok(response.predicted_temperature)
    }

    async fn predict_trend(
        &self,
        sensor_id: &str,
        history: &[HistoryPoint],
        horizon_seconds: u64,
    ) -> AppResult<Vec<f64>> {
        let request = TrendRequest {
            sensor_id,
            history_data: history,
            predict_horizon_seconds: horizon_seconds,
        };
        let response: TrendResponse = self.post(&self.trend_url, &request).await?;
        Ok(response.forecast_temperatures)
    }
}
