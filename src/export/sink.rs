//! Remote destination of exported Readings.

use crate::config::ExportConfig;
use crate::error::{AppResult, GatewayError};
use crate::reading::Reading;
use async_trait::async_trait;
use std::time::Duration;

/// Accepts one Reading or a batch. Success or failure only: a failed batch is
/// treated as if none of its items arrived.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn send_one(&self, reading: &Reading) -> AppResult<()>;
    async fn send_batch(&self, readings: &[Reading]) -> AppResult<()>;
}

/// JSON `POST` to the single-record and batch endpoints.
pub struct HttpExportSink {
    client: reqwest::Client,
    url: String,
    batch_url: String,
}

impl HttpExportSink {
    pub fn new(config: &ExportConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            batch_url: config.batch_url(),
        })
    }

    async fn post<T: serde::Serialize + Sync + ?Sized>(&self, url: &str, body: &T) -> AppResult<()> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::Remote(format!("{url} answered {status}")))
        }
    }
}

#[async_trait]
impl ExportSink for HttpExportSink {
    async fn send_one(&self, reading: &Reading) -> AppResult<()> {
        self.post(&self.url, reading).await
    }

    async fn send_batch(&self, readings: &[Reading]) -> AppResult<()> {
        self.post(&self.batch_url, readings).await
    }
}
