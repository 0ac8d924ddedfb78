//! The persisted time-series record and its storage tiers.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned row identifier.
pub type ReadingId = i64;

/// Granularity a [`Reading`] is stored at.
///
/// Raw samples start at `Realtime` and only ever move to a coarser tier by being
/// folded into a new aggregate row. `Predicted` holds forecast alarms and never
/// takes part in compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageTier {
    Realtime,
    Minutely,
    Hourly,
    Predicted,
}

impl StorageTier {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageTier::Realtime => "REALTIME",
            StorageTier::Minutely => "MINUTELY",
            StorageTier::Hourly => "HOURLY",
            StorageTier::Predicted => "PREDICTED",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REALTIME" => Ok(StorageTier::Realtime),
            "MINUTELY" => Ok(StorageTier::Minutely),
            "HOURLY" => Ok(StorageTier::Hourly),
            "PREDICTED" => Ok(StorageTier::Predicted),
            other => Err(format!("unknown storage tier '{other}'")),
        }
    }
}

/// Decoded values of one successful sensor read. Temperature is the primary
/// measurement and is always present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
}

/// One row of the time-series.
///
/// Serialized with the field names the remote store expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// `None` until the store has assigned one.
    pub id: Option<ReadingId>,
    pub device_id: String,
    pub sensor_id: String,
    pub sensor_name: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub predicted_temperature: Option<f64>,
    #[serde(rename = "alarmTriggered")]
    pub alarm: bool,
    pub alarm_message: Option<String>,
    #[serde(rename = "uploaded")]
    pub exported: bool,
    #[serde(rename = "dataType")]
    pub tier: StorageTier,
}

impl Reading {
    /// A fresh raw sample: tier `Realtime`, not exported, no enrichment.
    pub fn realtime(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        sensor_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        measurements: Measurements,
    ) -> Self {
        Self {
            id: None,
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            sensor_name: sensor_name.into(),
            timestamp,
            temperature: Some(measurements.temperature),
            humidity: measurements.humidity,
            pressure: measurements.pressure,
            predicted_temperature: None,
            alarm: false,
            alarm_message: None,
            exported: false,
            tier: StorageTier::Realtime,
        }
    }
}

/// Start of the fixed-width UTC bucket containing `timestamp`.
pub fn bucket_start(timestamp: DateTime<Utc>, width_secs: i64) -> DateTime<Utc> {
    let width = width_secs.max(1);
    let secs = timestamp.timestamp().div_euclid(width) * width;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(timestamp)
}

/// Arithmetic mean of the present values, `None` when nothing is present.
pub fn mean_of_present<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_truncates_epoch_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 31, 1, 59, 59).unwrap();
        assert_eq!(
            bucket_start(ts, 3600),
            Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start(ts, 60),
            Utc.with_ymd_and_hms(2024, 3, 31, 1, 59, 0).unwrap()
        );
    }

    #[test]
    fn mean_ignores_absent_values() {
        assert_eq!(mean_of_present([Some(20.0), None, Some(24.0)]), Some(22.0));
        assert_eq!(mean_of_present([None, None]), None);
    }

    #[test]
    fn wire_names_match_remote_store() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let reading = Reading::realtime(
            "edge-1",
            "s1",
            "Boiler",
            ts,
            Measurements {
                temperature: 21.5,
                humidity: None,
                pressure: None,
            },
        );
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["sensorId"], "s1");
        assert_eq!(json["alarmTriggered"], false);
        assert_eq!(json["uploaded"], false);
        assert_eq!(json["dataType"], "REALTIME");
        assert!(json["humidity"].is_null());
    }

    #[test]
    fn tier_parses_its_own_name() {
        for tier in [
            StorageTier::Realtime,
            StorageTier::Minutely,
            StorageTier::Hourly,
            StorageTier::Predicted,
        ] {
            assert_eq!(tier.as_str().parse::<StorageTier>().unwrap(), tier);
        }
    }
}
