//! Feature builder for the health classifier.
//!
//! Enriches each reading with rolling statistics, environment/diameter
//! correlations, stress indicators and a per-device growth anomaly flag.
//! Devices are processed independently and concatenated in the order they
//! first appear.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::rolling::{rolling_corr, rolling_mean, rolling_std, series_mean, series_std};
use crate::models::{group_by_device, SensorReading};

// ---

/// Short and long rolling windows, in samples (hourly data: 24h and 72h).
pub const ROLLING_WINDOWS: [usize; 2] = [24, 72];

/// Window for the environment/diameter correlations.
pub const CORRELATION_WINDOW: usize = 24;

/// Optimal temperature band for Sengon, in °C.
pub const OPTIMAL_TEMP_RANGE: (f64, f64) = (20.0, 32.0);

/// Soil moisture below this percentage counts as moisture stress.
pub const MOISTURE_STRESS_PERCENT: f64 = 40.0;

/// Growth rates further than this many standard deviations from the
/// device mean are flagged.
pub const GROWTH_ANOMALY_SIGMA: f64 = 2.0;

/// A reading enriched with derived features. One row per input reading.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    // ---
    pub reading: SensorReading,

    pub diameter_mean_24h: Option<f64>,
    pub diameter_std_24h: Option<f64>,
    pub growth_rate_mean_24h: Option<f64>,
    pub growth_rate_std_24h: Option<f64>,

    pub diameter_mean_72h: Option<f64>,
    pub diameter_std_72h: Option<f64>,
    pub growth_rate_mean_72h: Option<f64>,
    pub growth_rate_std_72h: Option<f64>,

    pub temp_diameter_corr: Option<f64>,
    pub humidity_diameter_corr: Option<f64>,

    pub temp_stress: bool,
    pub moisture_stress: bool,
    pub growth_anomaly: bool,
}

/// Numeric columns a [`FeatureRow`] exposes to the classifier.
///
/// The string names are what gets persisted next to the trained model, so
/// they must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureColumn {
    // ---
    DiameterMm,
    GrowthRateMmPerHour,
    TemperatureC,
    HumidityPercent,
    SoilMoisturePercent,
    BatteryVoltage,
    WifiRssi,
    DiameterMean24h,
    DiameterStd24h,
    GrowthRateMean24h,
    GrowthRateStd24h,
    DiameterMean72h,
    DiameterStd72h,
    GrowthRateMean72h,
    GrowthRateStd72h,
    TempDiameterCorr,
    HumidityDiameterCorr,
    TempStress,
    MoistureStress,
    GrowthAnomaly,
}

impl FeatureColumn {
    // ---
    pub const ALL: [FeatureColumn; 20] = [
        FeatureColumn::DiameterMm,
        FeatureColumn::GrowthRateMmPerHour,
        FeatureColumn::TemperatureC,
        FeatureColumn::HumidityPercent,
        FeatureColumn::SoilMoisturePercent,
        FeatureColumn::BatteryVoltage,
        FeatureColumn::WifiRssi,
        FeatureColumn::DiameterMean24h,
        FeatureColumn::DiameterStd24h,
        FeatureColumn::GrowthRateMean24h,
        FeatureColumn::GrowthRateStd24h,
        FeatureColumn::DiameterMean72h,
        FeatureColumn::DiameterStd72h,
        FeatureColumn::GrowthRateMean72h,
        FeatureColumn::GrowthRateStd72h,
        FeatureColumn::TempDiameterCorr,
        FeatureColumn::HumidityDiameterCorr,
        FeatureColumn::TempStress,
        FeatureColumn::MoistureStress,
        FeatureColumn::GrowthAnomaly,
    ];

    pub fn name(&self) -> &'static str {
        // ---
        match self {
            FeatureColumn::DiameterMm => "diameter_mm",
            FeatureColumn::GrowthRateMmPerHour => "growth_rate_mm_per_hour",
            FeatureColumn::TemperatureC => "temperature_c",
            FeatureColumn::HumidityPercent => "humidity_percent",
            FeatureColumn::SoilMoisturePercent => "soil_moisture_percent",
            FeatureColumn::BatteryVoltage => "battery_voltage",
            FeatureColumn::WifiRssi => "wifi_rssi",
            FeatureColumn::DiameterMean24h => "diameter_mean_24h",
            FeatureColumn::DiameterStd24h => "diameter_std_24h",
            FeatureColumn::GrowthRateMean24h => "growth_rate_mean_24h",
            FeatureColumn::GrowthRateStd24h => "growth_rate_std_24h",
            FeatureColumn::DiameterMean72h => "diameter_mean_72h",
            FeatureColumn::DiameterStd72h => "diameter_std_72h",
            FeatureColumn::GrowthRateMean72h => "growth_rate_mean_72h",
            FeatureColumn::GrowthRateStd72h => "growth_rate_std_72h",
            FeatureColumn::TempDiameterCorr => "temp_diameter_corr",
            FeatureColumn::HumidityDiameterCorr => "humidity_diameter_corr",
            FeatureColumn::TempStress => "temp_stress",
            FeatureColumn::MoistureStress => "moisture_stress",
            FeatureColumn::GrowthAnomaly => "growth_anomaly",
        }
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureColumn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureColumn::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown feature column '{}'", s))
    }
}

impl FeatureRow {
    // ---
    /// Value of one column, `None` when the underlying reading or statistic
    /// is missing.
    pub fn value(&self, column: FeatureColumn) -> Option<f64> {
        // ---
        let r = &self.reading;
        match column {
            FeatureColumn::DiameterMm => Some(r.diameter_mm),
            FeatureColumn::GrowthRateMmPerHour => r.growth_rate_mm_per_hour,
            FeatureColumn::TemperatureC => r.temperature_c,
            FeatureColumn::HumidityPercent => r.humidity_percent,
            FeatureColumn::SoilMoisturePercent => r.soil_moisture_percent,
            FeatureColumn::BatteryVoltage => r.battery_voltage,
            FeatureColumn::WifiRssi => r.wifi_rssi.map(f64::from),
            FeatureColumn::DiameterMean24h => self.diameter_mean_24h,
            FeatureColumn::DiameterStd24h => self.diameter_std_24h,
            FeatureColumn::GrowthRateMean24h => self.growth_rate_mean_24h,
            FeatureColumn::GrowthRateStd24h => self.growth_rate_std_24h,
            FeatureColumn::DiameterMean72h => self.diameter_mean_72h,
            FeatureColumn::DiameterStd72h => self.diameter_std_72h,
            FeatureColumn::GrowthRateMean72h => self.growth_rate_mean_72h,
            FeatureColumn::GrowthRateStd72h => self.growth_rate_std_72h,
            FeatureColumn::TempDiameterCorr => self.temp_diameter_corr,
            FeatureColumn::HumidityDiameterCorr => self.humidity_diameter_corr,
            FeatureColumn::TempStress => Some(flag(self.temp_stress)),
            FeatureColumn::MoistureStress => Some(flag(self.moisture_stress)),
            FeatureColumn::GrowthAnomaly => Some(flag(self.growth_anomaly)),
        }
    }

    /// Values for `columns` in order, or `None` if any of them is missing.
    pub fn vector(&self, columns: &[FeatureColumn]) -> Option<Vec<f64>> {
        columns.iter().map(|c| self.value(*c)).collect()
    }
}

/// Build feature rows for every reading.
pub fn build_features(readings: &[SensorReading]) -> Vec<FeatureRow> {
    // ---
    group_by_device(readings)
        .into_iter()
        .flat_map(|(_, rows)| device_features(&rows))
        .collect()
}

fn device_features(rows: &[&SensorReading]) -> Vec<FeatureRow> {
    // ---
    let diameter: Vec<Option<f64>> = rows.iter().map(|r| Some(r.diameter_mm)).collect();
    let growth: Vec<Option<f64>> = rows.iter().map(|r| r.growth_rate_mm_per_hour).collect();
    let temperature: Vec<Option<f64>> = rows.iter().map(|r| r.temperature_c).collect();
    let humidity: Vec<Option<f64>> = rows.iter().map(|r| r.humidity_percent).collect();

    let [short, long] = ROLLING_WINDOWS;
    let diameter_mean_short = rolling_mean(&diameter, short);
    let diameter_std_short = rolling_std(&diameter, short);
    let growth_mean_short = rolling_mean(&growth, short);
    let growth_std_short = rolling_std(&growth, short);
    let diameter_mean_long = rolling_mean(&diameter, long);
    let diameter_std_long = rolling_std(&diameter, long);
    let growth_mean_long = rolling_mean(&growth, long);
    let growth_std_long = rolling_std(&growth, long);

    let temp_corr = rolling_corr(&temperature, &diameter, CORRELATION_WINDOW);
    let humidity_corr = rolling_corr(&humidity, &diameter, CORRELATION_WINDOW);

    let growth_mean = series_mean(&growth);
    let growth_std = series_std(&growth);

    rows.iter()
        .enumerate()
        .map(|(i, reading)| FeatureRow {
            reading: (*reading).clone(),
            diameter_mean_24h: diameter_mean_short[i],
            diameter_std_24h: diameter_std_short[i],
            growth_rate_mean_24h: growth_mean_short[i],
            growth_rate_std_24h: growth_std_short[i],
            diameter_mean_72h: diameter_mean_long[i],
            diameter_std_72h: diameter_std_long[i],
            growth_rate_mean_72h: growth_mean_long[i],
            growth_rate_std_72h: growth_std_long[i],
            temp_diameter_corr: temp_corr[i],
            humidity_diameter_corr: humidity_corr[i],
            temp_stress: reading.temperature_c.is_some_and(is_temperature_stress),
            moisture_stress: reading
                .soil_moisture_percent
                .is_some_and(|m| m < MOISTURE_STRESS_PERCENT),
            growth_anomaly: is_growth_anomaly(growth[i], growth_mean, growth_std),
        })
        .collect()
}

fn is_temperature_stress(temp: f64) -> bool {
    let (low, high) = OPTIMAL_TEMP_RANGE;
    temp > high || temp < low
}

fn is_growth_anomaly(value: Option<f64>, mean: Option<f64>, std: Option<f64>) -> bool {
    // ---
    match (value, mean, std) {
        (Some(v), Some(m), Some(s)) => (v - m).abs() > GROWTH_ANOMALY_SIGMA * s,
        _ => false,
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::fixtures::hourly_readings;

    #[test]
    fn test_one_row_per_reading_across_devices() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 30);
        readings.extend(hourly_readings("SENGON_002", 10));

        let rows = build_features(&readings);

        assert_eq!(rows.len(), 40);
        assert!(rows[..30].iter().all(|r| r.reading.device_id == "SENGON_001"));
        assert!(rows[30..].iter().all(|r| r.reading.device_id == "SENGON_002"));
    }

    #[test]
    fn test_rolling_features_restart_per_device() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 5);
        readings.extend(hourly_readings("SENGON_002", 5));

        let rows = build_features(&readings);

        // First row of each device sees only itself
        for idx in [0, 5] {
            let row = &rows[idx];
            assert_eq!(row.diameter_mean_24h, Some(row.reading.diameter_mm));
            assert_eq!(row.diameter_std_24h, None);
            assert_eq!(row.temp_diameter_corr, None);
        }
        assert!(rows[1].diameter_std_24h.is_some());
    }

    #[test]
    fn test_stress_flags() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 4);
        readings[0].temperature_c = Some(35.0);
        readings[1].temperature_c = Some(19.9);
        readings[2].temperature_c = Some(32.0);
        readings[3].temperature_c = None;
        readings[0].soil_moisture_percent = Some(39.0);
        readings[1].soil_moisture_percent = Some(40.0);
        readings[2].soil_moisture_percent = None;

        let rows = build_features(&readings);

        assert!(rows[0].temp_stress);
        assert!(rows[1].temp_stress);
        assert!(!rows[2].temp_stress);
        assert!(!rows[3].temp_stress);

        assert!(rows[0].moisture_stress);
        assert!(!rows[1].moisture_stress);
        assert!(!rows[2].moisture_stress);
    }

    #[test]
    fn test_growth_anomaly_flags_outlier_only() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 20);
        for r in readings.iter_mut() {
            r.growth_rate_mm_per_hour = Some(0.008);
        }
        readings[10].growth_rate_mm_per_hour = Some(0.5);

        let rows = build_features(&readings);

        assert!(rows[10].growth_anomaly);
        assert_eq!(rows.iter().filter(|r| r.growth_anomaly).count(), 1);
    }

    #[test]
    fn test_vector_follows_column_order_and_rejects_gaps() {
        // ---
        let readings = hourly_readings("SENGON_001", 3);
        let rows = build_features(&readings);

        let cols = [FeatureColumn::WifiRssi, FeatureColumn::DiameterMm];
        let v = rows[2].vector(&cols).unwrap();
        assert_eq!(v[0], f64::from(readings[2].wifi_rssi.unwrap()));
        assert_eq!(v[1], readings[2].diameter_mm);

        // Std over a single sample is missing
        assert!(rows[0].vector(&FeatureColumn::ALL).is_none());
        assert!(rows[2].vector(&FeatureColumn::ALL).is_some());
    }

    #[test]
    fn test_column_names_parse_back() {
        // ---
        for col in FeatureColumn::ALL {
            assert_eq!(col.name().parse::<FeatureColumn>().unwrap(), col);
        }
        assert!("leaf_area".parse::<FeatureColumn>().is_err());
    }
}
