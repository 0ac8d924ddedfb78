//! Round-robin tick of one connection.

use crate::config::SensorDefinition;
use crate::hardware::BusTransport;
use crate::ingest::SampleIngestor;
use crate::reading::Reading;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Services one sensor of its connection per tick, in a fixed rotation.
pub struct ConnectionScheduler {
    transport: Arc<BusTransport>,
    sensors: Vec<SensorDefinition>,
    cursor: AtomicUsize,
    ingestor: Arc<SampleIngestor>,
}

impl ConnectionScheduler {
    pub fn new(transport: Arc<BusTransport>, sensors: Vec<SensorDefinition>, ingestor: Arc<SampleIngestor>) -> Self {
        Self {
            transport,
            sensors,
            cursor: AtomicUsize::new(0),
            ingestor,
        }
    }

    pub fn connection(&self) -> &str {
        self.transport.name()
    }

    pub fn transport(&self) -> &Arc<BusTransport> {
        &self.transport
    }

    pub fn sensors(&self) -> &[SensorDefinition] {
        &self.sensors
    }

    /// Advance the cursor and return the sensor it pointed at.
    pub fn next_sensor(&self) -> Option<&SensorDefinition> {
        if self.sensors.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sensors.len();
        self.sensors.get(index)
    }

    /// Poll the next sensor. Failures are logged and the sensor is skipped
    /// until its next turn.
    pub async fn tick(&self) -> Option<Reading> {
        let sensor = self.next_sensor()?;
        let measurements = match self.transport.read_sample(sensor).await {
            Ok(measurements) => measurements,
            Err(e) => {
                tracing::warn!(
                    connection = %self.connection(),
                    sensor = %sensor.id,
                    error = %e,
                    "Sample skipped"
                );
                return None;
            }
        };

        match self.ingestor.ingest(sensor, Utc::now(), measurements).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                tracing::error!(sensor = %sensor.id, error = %e, "Failed to store sample");
                None
            }
        }
    }

    /// Smallest effective poll interval among this connection's sensors.
    pub fn target_interval(&self, overrides: &HashMap<String, Duration>, default: Duration) -> Duration {
        self.sensors
            .iter()
            .map(|sensor| overrides.get(&sensor.id).copied().unwrap_or(default))
            .min()
            .unwrap_or(default)
    }

    /// Tick period that visits every sensor once per `target`.
    pub fn tick_period(&self, target: Duration, floor: Duration) -> Duration {
        tick_period(target, self.sensors.len(), floor)
    }
}

/// `max(floor, target / sensor_count)`
pub fn tick_period(target: Duration, sensor_count: usize, floor: Duration) -> Duration {
    let count = u32::try_from(sensor_count.max(1)).unwrap_or(u32::MAX);
    (target / count).max(floor)
}
