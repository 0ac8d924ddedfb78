//! Polling of every configured serial connection.
//!
//! Each connection that opened successfully gets one [`ConnectionScheduler`]
//! driven by its own periodic task. A connection that fails to open is logged
//! and left out; the others poll normally.
//!
//! Per-sensor poll interval overrides live in a copy-on-write snapshot. Any
//! change recomputes the tick period of every connection and reschedules the
//! ones whose period moved.

pub mod scheduler;

pub use scheduler::{tick_period, ConnectionScheduler};

use crate::config::GatewayConfig;
use crate::error_recovery::RetryPolicy;
use crate::hardware::{BusTransport, TransportSettings};
use crate::ingest::SampleIngestor;
use crate::periodic::{spawn_periodic, TaskHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type IntervalOverrides = HashMap<String, Duration>;

struct ConnectionPoller {
    scheduler: Arc<ConnectionScheduler>,
    task: TaskHandle,
}

pub struct PollingSupervisor {
    default_interval: Duration,
    min_tick: Duration,
    overrides: RwLock<Arc<IntervalOverrides>>,
    pollers: Vec<ConnectionPoller>,
}

impl PollingSupervisor {
    /// Transport settings shared by every connection.
    pub fn transport_settings(config: &GatewayConfig) -> TransportSettings {
        let serial = &config.serial;
        TransportSettings {
            timeout: Duration::from_millis(serial.timeout_ms),
            retry: RetryPolicy::with_retries(serial.retries, Duration::from_millis(serial.retry_delay_ms)),
            combine_reads: serial.combine_reads,
        }
    }

    /// Open every configured connection, skipping the ones that fail.
    pub async fn open_transports(config: &GatewayConfig) -> Vec<Arc<BusTransport>> {
        let mut open = Vec::new();
        for connection in &config.serial.connections {
            if config.sensors_on(&connection.name).next().is_none() {
                tracing::info!(connection = %connection.name, "No sensors attached, connection not opened");
                continue;
            }
            let transport = BusTransport::new(&connection.name, Self::transport_settings(config));

            #[cfg(feature = "serial")]
            {
                let line = connection.line_settings(&config.serial);
                match transport.open_serial(&line, config.serial.drain_timeout_ms).await {
                    Ok(()) => open.push(Arc::new(transport)),
                    Err(e) => tracing::error!(
                        connection = %connection.name,
                        port = %connection.port,
                        error = %e,
                        "Failed to open serial connection, its sensors will not be polled"
                    ),
                }
            }

            #[cfg(not(feature = "serial"))]
            {
                drop(transport);
                tracing::error!(
                    connection = %connection.name,
                    error = %crate::error::GatewayError::FeatureNotEnabled("serial".into()),
                    "Cannot open serial connection"
                );
            }
        }
        tracing::info!(
            open = open.len(),
            configured = config.serial.connections.len(),
            "Serial connections initialized"
        );
        open
    }

    /// Start one periodic poller per transport.
    pub fn start(transports: Vec<Arc<BusTransport>>, config: &GatewayConfig, ingestor: Arc<SampleIngestor>) -> Self {
        let default_interval = config.default_poll_interval();
        let min_tick = Duration::from_millis(config.serial.min_tick_ms);
        let overrides: IntervalOverrides = config
            .serial
            .sensors
            .iter()
            .filter_map(|s| s.poll_interval_ms.map(|ms| (s.id.clone(), Duration::from_millis(ms))))
            .collect();

        let pollers = transports
            .into_iter()
            .filter_map(|transport| {
                let sensors: Vec<_> = config.sensors_on(transport.name()).cloned().collect();
                if sensors.is_empty() {
                    return None;
                }
                let scheduler = Arc::new(ConnectionScheduler::new(transport, sensors, Arc::clone(&ingestor)));
                let target = scheduler.target_interval(&overrides, default_interval);
                let period = scheduler.tick_period(target, min_tick);
                tracing::info!(
                    connection = %scheduler.connection(),
                    sensors = scheduler.sensors().len(),
                    ?period,
                    "Polling started"
                );

                let tick_scheduler = Arc::clone(&scheduler);
                let task = spawn_periodic(format!("poll:{}", scheduler.connection()), period, move || {
                    let scheduler = Arc::clone(&tick_scheduler);
                    async move {
                        scheduler.tick().await;
                    }
                });
                Some(ConnectionPoller { scheduler, task })
            })
            .collect();

        Self {
            default_interval,
            min_tick,
            overrides: RwLock::new(Arc::new(overrides)),
            pollers,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Names of the connections being polled.
    pub fn connections(&self) -> Vec<String> {
        self.pollers
            .iter()
            .map(|p| p.scheduler.connection().to_string())
            .collect()
    }

    /// Current tick period of `connection`.
    pub fn tick_period(&self, connection: &str) -> Option<Duration> {
        self.pollers
            .iter()
            .find(|p| p.scheduler.connection() == connection)
            .and_then(|p| p.task.period())
    }

    /// Effective poll interval of `sensor_id`.
    pub fn interval_for(&self, sensor_id: &str) -> Duration {
        self.overrides
            .read()
            .get(sensor_id)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Set or clear the override of one sensor.
    pub fn set_interval(&self, sensor_id: &str, interval: Option<Duration>) {
        let snapshot = {
            let mut guard = self.overrides.write();
            let mut next = (**guard).clone();
            match interval {
                Some(interval) => next.insert(sensor_id.to_string(), interval.max(Duration::from_millis(1))),
                None => next.remove(sensor_id),
            };
            *guard = Arc::new(next);
            Arc::clone(&guard)
        };
        self.apply(&snapshot);
    }

    /// Merge `intervals` into the current overrides.
    pub fn update_intervals(&self, intervals: IntervalOverrides) {
        if intervals.is_empty() {
            return;
        }
        let snapshot = {
            let mut guard = self.overrides.write();
            let mut next = (**guard).clone();
            next.extend(intervals);
            *guard = Arc::new(next);
            Arc::clone(&guard)
        };
        self.apply(&snapshot);
    }

    fn apply(&self, overrides: &IntervalOverrides) {
        for poller in &self.pollers {
            let target = poller.scheduler.target_interval(overrides, self.default_interval);
            let period = poller.scheduler.tick_period(target, self.min_tick);
            if poller.task.reschedule(period) {
                tracing::info!(connection = %poller.scheduler.connection(), ?period, "Polling rescheduled");
            }
        }
    }

    /// Stop every poller, then close the transports.
    pub async fn shutdown(&self) {
        for poller in &self.pollers {
            poller.task.shutdown().await;
        }
        for poller in &self.pollers {
            poller.scheduler.transport().close().await;
        }
    }
}
