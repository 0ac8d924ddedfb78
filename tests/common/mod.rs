//! Shared fakes for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use edge_gateway::config::{ConnectionDefinition, GatewayConfig, SensorDefinition};
use edge_gateway::config_sync::{ConfigSource, EdgeConfig};
use edge_gateway::export::ExportSink;
use edge_gateway::hardware::{BusLink, ReadRequest, RegisterDescriptor};
use edge_gateway::prediction::{HistoryPoint, PredictionClient};
use edge_gateway::{AppResult, GatewayError, Reading};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One observed bus transaction.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub unit: u8,
    pub start: Instant,
    pub end: Instant,
}

/// A bus whose every transaction takes `latency`, answering from a register
/// map shared by all units. Records the span of each transaction.
pub struct SlowLink {
    pub registers: HashMap<u16, u16>,
    pub latency: Duration,
    pub spans: Arc<Mutex<Vec<Span>>>,
}

impl SlowLink {
    pub fn new(registers: &[(u16, u16)], latency: Duration) -> (Self, Arc<Mutex<Vec<Span>>>) {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let link = Self {
            registers: registers.iter().copied().collect(),
            latency,
            spans: spans.clone(),
        };
        (link, spans)
    }
}

#[async_trait]
impl BusLink for SlowLink {
    async fn read_registers(&mut self, request: &ReadRequest) -> AppResult<Vec<u16>> {
        let start = Instant::now();
        tokio::time::sleep(self.latency).await;
        let words = (request.start..request.start + request.count)
            .map(|address| {
                self.registers.get(&address).copied().ok_or(GatewayError::ModbusException {
                    unit: request.unit,
                    function: request.function_code(),
                    code: 0x02,
                })
            })
            .collect();
        self.spans.lock().push(Span {
            unit: request.unit,
            start,
            end: Instant::now(),
        });
        words
    }
}

/// Export sink that can be switched offline.
#[derive(Default)]
pub struct SwitchableSink {
    pub offline: AtomicBool,
    pub singles: Mutex<Vec<Reading>>,
    pub batches: Mutex<Vec<Vec<Reading>>>,
}

impl SwitchableSink {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(GatewayError::Remote("network unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExportSink for SwitchableSink {
    async fn send_one(&self, reading: &Reading) -> AppResult<()> {
        self.check()?;
        self.singles.lock().push(reading.clone());
        Ok(())
    }

    async fn send_batch(&self, readings: &[Reading]) -> AppResult<()> {
        self.check()?;
        self.batches.lock().push(readings.to_vec());
        Ok(())
    }
}

/// Forecaster answering every point request with the same value.
pub struct FixedForecast(pub Option<f64>);

#[async_trait]
impl PredictionClient for FixedForecast {
    async fn predict_point(&self, _: f64, _: Option<f64>, _: Option<f64>) -> AppResult<Option<f64>> {
        Ok(self.0)
    }

    async fn predict_trend(&self, _: &str, _: &[HistoryPoint], _: u64) -> AppResult<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// Config source serving whatever document is currently set.
#[derive(Default)]
pub struct StaticConfigSource(pub Mutex<Option<EdgeConfig>>);

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> AppResult<Option<EdgeConfig>> {
        Ok(self.0.lock().clone())
    }
}

pub fn sensor(id: &str, connection: &str, unit: u8, temperature: RegisterDescriptor) -> SensorDefinition {
    SensorDefinition {
        id: id.to_string(),
        name: format!("Sensor {id}"),
        connection: connection.to_string(),
        unit,
        temperature: Some(temperature),
        humidity: None,
        pressure: None,
        poll_interval_ms: None,
    }
}

pub fn connection(name: &str) -> ConnectionDefinition {
    ConnectionDefinition {
        name: name.to_string(),
        port: format!("/dev/tty-{name}"),
        baud_rate: None,
        data_bits: None,
        stop_bits: None,
        parity: None,
        framing: None,
    }
}

/// In-memory gateway configuration with every remote feature off.
pub fn offline_config(sensors: Vec<SensorDefinition>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    let mut names: Vec<String> = sensors.iter().map(|s| s.connection.clone()).collect();
    names.dedup();
    config.serial.connections = names.iter().map(|n| connection(n)).collect();
    config.serial.sensors = sensors;
    config.export.enabled = false;
    config.prediction.enabled = false;
    config.config_sync.enabled = false;
    config.compaction.enabled = false;
    config
}

/// Poll `check` until it holds, advancing time in small steps.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
