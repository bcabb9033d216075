//! Simple data models for the Sengon ML pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// One row of the `sensor_data` table as read by the pipeline.
///
/// `diameter_mm` is never null because the fetch query filters those rows
/// out; every other measurement may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorReading {
    // ---
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub diameter_mm: f64,
    pub growth_rate_mm_per_hour: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_percent: Option<f64>,
    pub soil_moisture_percent: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub wifi_rssi: Option<i32>,
}

/// Plant health state assigned by the label deriver and predicted by the
/// health classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    // ---
    Anomaly,
    AtRisk,
    Healthy,
    Stressed,
    Unknown,
}

impl HealthLabel {
    // ---
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            HealthLabel::Anomaly => "anomaly",
            HealthLabel::AtRisk => "at_risk",
            HealthLabel::Healthy => "healthy",
            HealthLabel::Stressed => "stressed",
            HealthLabel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "anomaly" => Ok(HealthLabel::Anomaly),
            "at_risk" => Ok(HealthLabel::AtRisk),
            "healthy" => Ok(HealthLabel::Healthy),
            "stressed" => Ok(HealthLabel::Stressed),
            "unknown" => Ok(HealthLabel::Unknown),
            other => Err(anyhow::anyhow!("Unknown health label '{}'", other)),
        }
    }
}

/// Group readings by device, preserving the order in which devices first
/// appear and sorting each device's rows by time (stable).
pub fn group_by_device(readings: &[SensorReading]) -> Vec<(String, Vec<&SensorReading>)> {
    // ---
    let mut groups: Vec<(String, Vec<&SensorReading>)> = Vec::new();

    for reading in readings {
        match groups.iter_mut().find(|(id, _)| *id == reading.device_id) {
            Some((_, rows)) => rows.push(reading),
            None => groups.push((reading.device_id.clone(), vec![reading])),
        }
    }

    for (_, rows) in groups.iter_mut() {
        rows.sort_by_key(|r| r.time);
    }

    groups
}
