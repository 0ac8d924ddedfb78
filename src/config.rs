//! Gateway configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `EDGE_GATEWAY_`, `__` separating
//!    nested keys (`EDGE_GATEWAY_EXPORT__BATCH_SIZE=100`)
//!
//! Every tunable has a serde default, so an empty file yields a runnable
//! gateway with no sensors.
//!
//! # Example
//! ```no_run
//! use edge_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load_from("config/gateway.toml")?;
//! config.validate()?;
//! println!("Device: {}", config.application.device_id);
//! # Ok::<(), edge_gateway::error::GatewayError>(())
//! ```

use crate::error::{AppResult, GatewayError};
use crate::hardware::decoder::RegisterDescriptor;
use crate::hardware::modbus::Framing;
use crate::hardware::serial::{LineSettings, Parity};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub alarm: AlarmConfig,
    #[serde(default)]
    pub config_sync: ConfigSyncConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Identifier stamped on every Reading and used by config sync
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Serial bus configuration: line defaults, connections and sensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub framing: Framing,
    /// Target interval between two reads of the same sensor
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lower bound of a connection's tick period
    #[serde(default = "default_min_tick_ms")]
    pub min_tick_ms: u64,
    /// Timeout of one request/response attempt
    #[serde(default = "default_transaction_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after a transient failure
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long to drain stale bytes before each attempt (0 disables)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Read co-located registers of a sensor in a single request
    #[serde(default = "default_true")]
    pub combine_reads: bool,
    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            framing: Framing::default(),
            poll_interval_ms: default_poll_interval_ms(),
            min_tick_ms: default_min_tick_ms(),
            timeout_ms: default_transaction_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            combine_reads: true,
            connections: Vec::new(),
            sensors: Vec::new(),
        }
    }
}

/// One physical serial connection. Unset line parameters fall back to the
/// `[serial]` defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    pub name: String,
    pub port: String,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub parity: Option<Parity>,
    #[serde(alias = "encoding")]
    pub framing: Option<Framing>,
}

impl ConnectionDefinition {
    /// Line parameters with the serial defaults filled in.
    pub fn line_settings(&self, defaults: &SerialConfig) -> LineSettings {
        LineSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate.unwrap_or(defaults.baud_rate),
            data_bits: self.data_bits.unwrap_or(defaults.data_bits),
            stop_bits: self.stop_bits.unwrap_or(defaults.stop_bits),
            parity: self.parity.unwrap_or(defaults.parity),
            framing: self.framing.unwrap_or(defaults.framing),
        }
    }
}

/// One logical sensor on a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub id: String,
    /// Display name
    pub name: String,
    /// Name of the owning connection
    pub connection: String,
    /// Bus address of the device
    #[serde(alias = "slave_id")]
    pub unit: u8,
    pub temperature: Option<RegisterDescriptor>,
    pub humidity: Option<RegisterDescriptor>,
    pub pressure: Option<RegisterDescriptor>,
    /// Per-sensor override of `serial.poll_interval_ms`
    pub poll_interval_ms: Option<u64>,
}

/// Retention horizons per tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Raw rows older than this are aggregated into MINUTELY
    #[serde(default = "default_realtime_minutes")]
    pub realtime_minutes: u64,
    /// MINUTELY rows older than this are aggregated into HOURLY
    #[serde(default = "default_minutely_hours")]
    pub minutely_hours: u64,
    /// HOURLY rows older than this are purged
    #[serde(default = "default_hourly_days")]
    pub hourly_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            realtime_minutes: default_realtime_minutes(),
            minutely_hours: default_minutely_hours(),
            hourly_days: default_hourly_days(),
        }
    }
}

impl RetentionConfig {
    /// Longest horizon any tier may keep, in days.
    pub const MAX_HORIZON_DAYS: u64 = 36_500;

    /// Horizons are clamped to [`Self::MAX_HORIZON_DAYS`] so that `now - horizon`
    /// stays representable even for a config that skipped validation.
    pub fn realtime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.realtime_minutes.min(Self::MAX_HORIZON_DAYS * 24 * 60) as i64)
    }

    pub fn minutely(&self) -> chrono::Duration {
        chrono::Duration::hours(self.minutely_hours.min(Self::MAX_HORIZON_DAYS * 24) as i64)
    }

    pub fn hourly(&self) -> chrono::Duration {
        chrono::Duration::days(self.hourly_days.min(Self::MAX_HORIZON_DAYS) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_compaction_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_compaction_interval_secs(),
        }
    }
}

/// Remote export endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Single-record endpoint
    #[serde(default = "default_export_url")]
    pub url: String,
    /// Batch endpoint, `<url>/batch` when unset
    pub batch_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_export_url(),
            batch_url: None,
            batch_size: default_batch_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl ExportConfig {
    pub fn batch_url(&self) -> String {
        self.batch_url
            .clone()
            .unwrap_or_else(|| format!("{}/batch", self.url.trim_end_matches('/')))
    }
}

/// Remote prediction service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_point_url")]
    pub point_url: String,
    #[serde(default = "default_trend_url")]
    pub trend_url: String,
    #[serde(default = "default_prediction_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub trend: TrendConfig,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            point_url: default_point_url(),
            trend_url: default_trend_url(),
            timeout_ms: default_prediction_timeout_ms(),
            trend: TrendConfig::default(),
        }
    }
}

/// Trend forecast monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trend_interval_ms")]
    pub interval_ms: u64,
    /// Length of the history sent to the forecaster
    #[serde(default = "default_history_minutes")]
    pub history_minutes: u64,
    #[serde(default = "default_horizon_seconds")]
    pub horizon_seconds: u64,
    /// Width of one history point and one forecast step
    #[serde(default = "default_step_seconds")]
    pub step_seconds: u64,
    /// Fraction of expected history points required before forecasting
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_trend_interval_ms(),
            history_minutes: default_history_minutes(),
            horizon_seconds: default_horizon_seconds(),
            step_seconds: default_step_seconds(),
            min_coverage: default_min_coverage(),
        }
    }
}

/// Compiled-in default thresholds, the last precedence layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_upper")]
    pub upper: f64,
    #[serde(default = "default_lower")]
    pub lower: f64,
    #[serde(default = "default_deviation")]
    pub deviation: f64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            upper: default_upper(),
            lower: default_lower(),
            deviation: default_deviation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `{deviceId}` is replaced by `application.device_id`
    #[serde(default = "default_config_sync_url")]
    pub url: String,
    #[serde(default = "default_config_sync_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_config_sync_url(),
            interval_ms: default_config_sync_interval_ms(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl ConfigSyncConfig {
    pub fn url_for(&self, device_id: &str) -> String {
        self.url.replace("{deviceId}", device_id)
    }
}

/// Bounded worker pool for post-sample enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file for the sqlite backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

// Default value functions
fn default_device_id() -> String {
    "jetson-001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_min_tick_ms() -> u64 {
    50
}

fn default_transaction_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    20
}

fn default_drain_timeout_ms() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_realtime_minutes() -> u64 {
    10
}

fn default_minutely_hours() -> u64 {
    24
}

fn default_hourly_days() -> u64 {
    7
}

fn default_compaction_interval_secs() -> u64 {
    60
}

fn default_export_url() -> String {
    "http://localhost:8080/api/sensor-data/upload".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_http_timeout_ms() -> u64 {
    5000
}

fn default_point_url() -> String {
    "http://localhost:5000/predict".to_string()
}

fn default_trend_url() -> String {
    "http://localhost:5000/predict_trend".to_string()
}

fn default_prediction_timeout_ms() -> u64 {
    3000
}

fn default_trend_interval_ms() -> u64 {
    30_000
}

fn default_history_minutes() -> u64 {
    10
}

fn default_horizon_seconds() -> u64 {
    60
}

fn default_step_seconds() -> u64 {
    5
}

fn default_min_coverage() -> f64 {
    0.8
}

fn default_upper() -> f64 {
    30.0
}

fn default_lower() -> f64 {
    10.0
}

fn default_deviation() -> f64 {
    2.0
}

fn default_config_sync_url() -> String {
    "http://localhost:8080/api/device/{deviceId}/config".to_string()
}

fn default_config_sync_interval_ms() -> u64 {
    300_000
}

fn default_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    25
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/readings.db")
}

impl GatewayConfig {
    /// Load configuration from `path` and `EDGE_GATEWAY_` environment variables.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack, exposed so callers can merge extra layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EDGE_GATEWAY_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(GatewayError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.application.device_id.trim().is_empty() {
            return invalid("application.device_id must not be empty".into());
        }

        let mut connections = HashSet::new();
        for connection in &self.serial.connections {
            if !connections.insert(connection.name.as_str()) {
                return invalid(format!("Duplicate connection name: {}", connection.name));
            }
        }

        let mut sensors = HashSet::new();
        for sensor in &self.serial.sensors {
            if !sensors.insert(sensor.id.as_str()) {
                return invalid(format!("Duplicate sensor ID: {}", sensor.id));
            }
            if sensor.temperature.is_none() {
                tracing::warn!(
                    sensor = %sensor.id,
                    "Sensor has no temperature register and will never produce a reading"
                );
            }
            if !connections.contains(sensor.connection.as_str()) {
                tracing::warn!(
                    sensor = %sensor.id,
                    connection = %sensor.connection,
                    "Sensor refers to an unknown connection and will not be polled"
                );
            }
            if sensor.poll_interval_ms == Some(0) {
                return invalid(format!("Sensor {} has a zero poll interval", sensor.id));
            }
        }

        if self.serial.poll_interval_ms == 0 {
            return invalid("serial.poll_interval_ms must be greater than 0".into());
        }

        if self.export.batch_size == 0 {
            return invalid("export.batch_size must be greater than 0".into());
        }

        if self.enrichment.workers == 0 || self.enrichment.queue_capacity == 0 {
            return invalid("enrichment.workers and enrichment.queue_capacity must be greater than 0".into());
        }

        let retention = &self.retention;
        if retention.realtime_minutes == 0 {
            return invalid("retention.realtime_minutes must be greater than 0".into());
        }
        if retention.hourly_days > RetentionConfig::MAX_HORIZON_DAYS
            || retention.minutely_hours > RetentionConfig::MAX_HORIZON_DAYS * 24
            || retention.realtime_minutes > RetentionConfig::MAX_HORIZON_DAYS * 24 * 60
        {
            return invalid(format!(
                "Retention horizons may not exceed {} days",
                RetentionConfig::MAX_HORIZON_DAYS
            ));
        }
        if retention.realtime() >= retention.minutely() || retention.minutely() >= retention.hourly() {
            return invalid(format!(
                "Retention horizons must grow with tier: realtime {}m, minutely {}h, hourly {}d",
                retention.realtime_minutes, retention.minutely_hours, retention.hourly_days
            ));
        }

        if self.alarm.lower > self.alarm.upper {
            return invalid(format!(
                "alarm.lower ({}) is above alarm.upper ({})",
                self.alarm.lower, self.alarm.upper
            ));
        }

        let trend = &self.prediction.trend;
        if trend.step_seconds == 0 || !(0.0..=1.0).contains(&trend.min_coverage) {
            return invalid("prediction.trend needs step_seconds > 0 and min_coverage in [0, 1]".into());
        }

        Ok(())
    }

    /// Sensors attached to the named connection, in configuration order.
    pub fn sensors_on<'a>(&'a self, connection: &'a str) -> impl Iterator<Item = &'a SensorDefinition> + 'a {
        self.serial
            .sensors
            .iter()
            .filter(move |sensor| sensor.connection == connection)
    }

    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.serial.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const SAMPLE: &str = r#"
        [application]
        device_id = "edge-7"

        [serial]
        baud_rate = 19200

        [[serial.connections]]
        name = "bus0"
        port = "/dev/ttyUSB0"

        [[serial.connections]]
        name = "bus1"
        port = "/dev/ttyUSB1"
        baud_rate = 9600
        framing = "ASCII"

        [[serial.sensors]]
        id = "s1"
        name = "Boiler"
        connection = "bus0"
        unit = 1
        temperature = { kind = "holding", address = 0, scale = 0.1 }
        humidity = { kind = "holding", address = 1, scale = 0.1 }
    "#;

    #[test]
    fn defaults_without_file() {
        let config = GatewayConfig::default();
        assert_eq!(config.application.device_id, "jetson-001");
        assert_eq!(config.retention.realtime_minutes, 10);
        assert_eq!(config.export.batch_size, 50);
        assert_eq!(config.export.batch_url(), "http://localhost:8080/api/sensor-data/upload/batch");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_file_and_resolves_line_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", SAMPLE)?;
            let config = GatewayConfig::load_from("gateway.toml").map_err(|e| e.to_string())?;
            config.validate().map_err(|e| e.to_string())?;

            let bus0 = config.serial.connections[0].line_settings(&config.serial);
            assert_eq!(bus0.baud_rate, 19200);
            assert_eq!(bus0.framing, Framing::Rtu);

            let bus1 = config.serial.connections[1].line_settings(&config.serial);
            assert_eq!(bus1.baud_rate, 9600);
            assert_eq!(bus1.framing, Framing::Ascii);

            let sensor = &config.serial.sensors[0];
            assert_eq!(sensor.temperature.as_ref().map(|t| t.scale), Some(0.1));
            assert!(sensor.pressure.is_none());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", SAMPLE)?;
            jail.set_env("EDGE_GATEWAY_EXPORT__BATCH_SIZE", "7");
            jail.set_env("EDGE_GATEWAY_APPLICATION__LOG_LEVEL", "debug");
            let config = GatewayConfig::load_from("gateway.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.export.batch_size, 7);
            assert_eq!(config.application.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    fn rejects_duplicate_sensor_ids() {
        let mut config = GatewayConfig::default();
        let sensor = SensorDefinition {
            id: "s1".into(),
            name: "a".into(),
            connection: "bus0".into(),
            unit: 1,
            temperature: None,
            humidity: None,
            pressure: None,
            poll_interval_ms: None,
        };
        config.serial.sensors = vec![sensor.clone(), sensor];
        assert!(matches!(config.validate(), Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn rejects_inverted_retention() {
        let mut config = GatewayConfig::default();
        config.retention.minutely_hours = 24 * 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_horizons_beyond_limit() {
        let mut config = GatewayConfig::default();
        config.retention.hourly_days = u64::MAX;
        assert!(matches!(config.validate(), Err(GatewayError::Configuration(_))));

        // accessors clamp instead of overflowing
        let huge = RetentionConfig {
            realtime_minutes: u64::MAX,
            minutely_hours: u64::MAX,
            hourly_days: u64::MAX,
        };
        assert_eq!(huge.hourly(), chrono::Duration::days(RetentionConfig::MAX_HORIZON_DAYS as i64));
        assert_eq!(huge.realtime(), huge.hourly());
        let _ = chrono::Utc::now() - huge.minutely();
    }

    #[test]
    fn config_sync_url_substitutes_device() {
        let sync = ConfigSyncConfig::default();
        assert_eq!(
            sync.url_for("edge-7"),
            "http://localhost:8080/api/device/edge-7/config"
        );
    }
}
