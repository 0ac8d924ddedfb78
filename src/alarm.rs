//! Alarm evaluation with layered thresholds.
//!
//! Each threshold field resolves independently through three layers:
//! sensor override, then global override, then the compiled-in default from
//! `[alarm]`. The override layers live in one immutable snapshot that is
//! replaced as a whole on every update, so an evaluation never observes a
//! half-applied change.

use crate::config::AlarmConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Message recorded on a Reading that raised no alarm.
pub const NO_ALARM: &str = "No Alarm";

/// A partial threshold triple. Absent fields fall through to the next layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    pub upper: Option<f64>,
    pub lower: Option<f64>,
    pub deviation: Option<f64>,
}

impl ThresholdOverride {
    pub fn upper(upper: f64) -> Self {
        Self {
            upper: Some(upper),
            ..Default::default()
        }
    }
}

/// Thresholds after resolving every layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveThresholds {
    pub upper: f64,
    pub lower: f64,
    pub deviation: f64,
}

impl EffectiveThresholds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlarmKind {
    OverTemperature { value: f64, upper: f64 },
    UnderTemperature { value: f64, lower: f64 },
    Deviation { actual: f64, predicted: f64, deviation: f64, threshold: f64 },
}

/// Outcome of [`AlarmEvaluator::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmVerdict {
    pub kind: Option<AlarmKind>,
    pub message: String,
}

impl AlarmVerdict {
    pub fn triggered(&self) -> bool {
        self.kind.is_some()
    }
}

#[derive(Debug, Default)]
struct Layers {
    global: Option<ThresholdOverride>,
    sensors: HashMap<String, ThresholdOverride>,
}

pub struct AlarmEvaluator {
    defaults: AlarmConfig,
    sensor_names: HashMap<String, String>,
    layers: RwLock<Arc<Layers>>,
}

impl AlarmEvaluator {
    /// `sensor_names` maps sensor id to display name for alarm messages.
    pub fn new(defaults: AlarmConfig, sensor_names: HashMap<String, String>) -> Self {
        Self {
            defaults,
            sensor_names,
            layers: RwLock::new(Arc::new(Layers::default())),
        }
    }

    fn snapshot(&self) -> Arc<Layers> {
        Arc::clone(&self.layers.read())
    }

    /// Replace the snapshot with a modified copy of the current one.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Layers),
    {
        let mut guard = self.layers.write();
        let mut next = Layers {
            global: guard.global,
            sensors: guard.sensors.clone(),
        };
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Set or clear the global override.
    pub fn set_global(&self, thresholds: Option<ThresholdOverride>) {
        self.update(|layers| layers.global = thresholds);
        tracing::info!(?thresholds, "Global alarm thresholds updated");
    }

    /// Set or clear one sensor's override.
    pub fn set_sensor(&self, sensor_id: &str, thresholds: Option<ThresholdOverride>) {
        self.update(|layers| match thresholds {
            Some(t) => {
                layers.sensors.insert(sensor_id.to_string(), t);
            }
            None => {
                layers.sensors.remove(sensor_id);
            }
        });
    }

    /// Replace both override layers in one step.
    pub fn replace(&self, global: Option<ThresholdOverride>, sensors: HashMap<String, ThresholdOverride>) {
        *self.layers.write() = Arc::new(Layers { global, sensors });
    }

    pub fn global_override(&self) -> Option<ThresholdOverride> {
        self.snapshot().global
    }

    pub fn sensor_override(&self, sensor_id: &str) -> Option<ThresholdOverride> {
        self.snapshot().sensors.get(sensor_id).copied()
    }

    pub fn thresholds(&self, sensor_id: &str) -> EffectiveThresholds {
        let layers = self.snapshot();
        let sensor = layers.sensors.get(sensor_id);
        let global = layers.global.as_ref();
        let resolve = |field: fn(&ThresholdOverride) -> Option<f64>, default: f64| {
            sensor
                .and_then(field)
                .or_else(|| global.and_then(field))
                .unwrap_or(default)
        };
        EffectiveThresholds {
            upper: resolve(|t| t.upper, self.defaults.upper),
            lower: resolve(|t| t.lower, self.defaults.lower),
            deviation: resolve(|t| t.deviation, self.defaults.deviation),
        }
    }

    /// Classify `actual` (and optionally its prediction) for `sensor_id`.
    ///
    /// Out of `[lower, upper]` wins over deviation from the prediction.
    pub fn evaluate(&self, sensor_id: &str, actual: f64, predicted: Option<f64>) -> AlarmVerdict {
        let t = self.thresholds(sensor_id);
        let kind = if actual > t.upper {
            Some(AlarmKind::OverTemperature { value: actual, upper: t.upper })
        } else if actual < t.lower {
            Some(AlarmKind::UnderTemperature { value: actual, lower: t.lower })
        } else {
            predicted.and_then(|predicted| {
                let deviation = (actual - predicted).abs();
                (deviation > t.deviation).then_some(AlarmKind::Deviation {
                    actual,
                    predicted,
                    deviation,
                    threshold: t.deviation,
                })
            })
        };

        let message = match &kind {
            Some(kind) => self.describe(sensor_id, kind),
            None => NO_ALARM.to_string(),
        };
        AlarmVerdict { kind, message }
    }

    /// Message for a forecast leaving the allowed band.
    pub fn predictive_message(&self, sensor_id: &str, forecast: f64, seconds_ahead: i64) -> String {
        let t = self.thresholds(sensor_id);
        let mut message = self.prefix(sensor_id);
        let _ = write!(
            message,
            "Predicted temperature {forecast:.2}°C in {seconds_ahead}s is outside [{:.2}, {:.2}]°C",
            t.lower, t.upper
        );
        message
    }

    fn prefix(&self, sensor_id: &str) -> String {
        let name = self
            .sensor_names
            .get(sensor_id)
            .map(String::as_str)
            .unwrap_or(sensor_id);
        format!("Sensor [{name} ({sensor_id})] ")
    }

    fn describe(&self, sensor_id: &str, kind: &AlarmKind) -> String {
        let mut message = self.prefix(sensor_id);
        let _ = match kind {
            AlarmKind::OverTemperature { value, upper } => {
                write!(message, "Temperature too high: {value:.2}°C (threshold: {upper:.2}°C)")
            }
            AlarmKind::UnderTemperature { value, lower } => {
                write!(message, "Temperature too low: {value:.2}°C (threshold: {lower:.2}°C)")
            }
            AlarmKind::Deviation {
                actual,
                predicted,
                deviation,
                threshold,
            } => write!(
                message,
                "Abnormal fluctuation: actual {actual:.2}°C, predicted {predicted:.2}°C \
                 (deviation: {deviation:.2}°C, threshold: {threshold:.2}°C)"
            ),
        };
        message
    }
}
