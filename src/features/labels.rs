//! Health label derivation from growth rate and environment.
//!
//! Sengon grows roughly 0.14-0.27 mm/day under good conditions. The bands
//! below are domain-tuned and must not be re-derived.

use super::health::FeatureRow;
use crate::models::HealthLabel;

// ---

/// Daily growth band considered normal, in mm/day (inclusive).
pub const NORMAL_GROWTH_DAILY: (f64, f64) = (0.1, 0.3);

/// Daily growth below this is at risk.
pub const AT_RISK_GROWTH_DAILY: f64 = 0.05;

/// Daily growth above this is treated as a measurement anomaly.
pub const ANOMALY_GROWTH_DAILY: f64 = 0.5;

/// Temperature band for a healthy label, in °C (inclusive).
pub const HEALTHY_TEMP_RANGE: (f64, f64) = (20.0, 32.0);

/// Minimum soil moisture for a healthy label, in percent.
pub const HEALTHY_MIN_SOIL_MOISTURE: f64 = 50.0;

/// Derive the health label for one observation.
pub fn derive_label(
    growth_rate_mm_per_hour: Option<f64>,
    temperature_c: Option<f64>,
    soil_moisture_percent: Option<f64>,
) -> HealthLabel {
    // ---
    let daily = match growth_rate_mm_per_hour {
        Some(rate) if !rate.is_nan() => rate * 24.0,
        _ => return HealthLabel::Unknown,
    };

    let (normal_low, normal_high) = NORMAL_GROWTH_DAILY;
    if (normal_low..=normal_high).contains(&daily) {
        let (temp_low, temp_high) = HEALTHY_TEMP_RANGE;
        let temp_ok = temperature_c.is_some_and(|t| (temp_low..=temp_high).contains(&t));
        let soil_ok = soil_moisture_percent.is_some_and(|m| m >= HEALTHY_MIN_SOIL_MOISTURE);

        if temp_ok && soil_ok {
            HealthLabel::Healthy
        } else {
            // Environmental stress
            HealthLabel::Stressed
        }
    } else if daily < AT_RISK_GROWTH_DAILY {
        HealthLabel::AtRisk
    } else if daily > ANOMALY_GROWTH_DAILY {
        HealthLabel::Anomaly
    } else {
        HealthLabel::Stressed
    }
}

/// Labels for a batch of feature rows, index-aligned.
pub fn derive_labels(rows: &[FeatureRow]) -> Vec<HealthLabel> {
    // ---
    rows.iter()
        .map(|row| {
            let r = &row.reading;
            derive_label(r.growth_rate_mm_per_hour, r.temperature_c, r.soil_moisture_percent)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const HOURLY_0_20: f64 = 0.20 / 24.0;

    #[test]
    fn test_healthy_in_range() {
        // ---
        assert_eq!(derive_label(Some(HOURLY_0_20), Some(25.0), Some(60.0)), HealthLabel::Healthy);
    }

    #[test]
    fn test_stressed_when_temperature_out_of_range() {
        // ---
        assert_eq!(derive_label(Some(HOURLY_0_20), Some(35.0), Some(60.0)), HealthLabel::Stressed);
        assert_eq!(derive_label(Some(HOURLY_0_20), Some(25.0), Some(49.9)), HealthLabel::Stressed);
        assert_eq!(derive_label(Some(HOURLY_0_20), None, Some(60.0)), HealthLabel::Stressed);
    }

    #[test]
    fn test_at_risk_ignores_environment() {
        // ---
        let rate = 0.02 / 24.0;
        assert_eq!(derive_label(Some(rate), Some(25.0), Some(60.0)), HealthLabel::AtRisk);
        assert_eq!(derive_label(Some(rate), Some(40.0), Some(10.0)), HealthLabel::AtRisk);
        assert_eq!(derive_label(Some(-0.01), None, None), HealthLabel::AtRisk);
    }

    #[test]
    fn test_anomaly_above_half_mm_per_day() {
        // ---
        assert_eq!(derive_label(Some(0.6 / 24.0), Some(25.0), Some(60.0)), HealthLabel::Anomaly);
    }

    #[test]
    fn test_gaps_between_bands_are_stressed() {
        // ---
        assert_eq!(derive_label(Some(0.07 / 24.0), Some(25.0), Some(60.0)), HealthLabel::Stressed);
        assert_eq!(derive_label(Some(0.4 / 24.0), Some(25.0), Some(60.0)), HealthLabel::Stressed);
    }

    #[test]
    fn test_missing_rate_is_unknown() {
        // ---
        assert_eq!(derive_label(None, Some(25.0), Some(60.0)), HealthLabel::Unknown);
        assert_eq!(derive_label(Some(f64::NAN), Some(25.0), Some(60.0)), HealthLabel::Unknown);
    }

    #[test]
    fn test_deterministic() {
        // ---
        let inputs = [
            (Some(HOURLY_0_20), Some(25.0), Some(60.0)),
            (Some(0.004), Some(33.0), Some(45.0)),
            (Some(0.03), None, Some(70.0)),
        ];
        for (g, t, m) in inputs {
            assert_eq!(derive_label(g, t, m), derive_label(g, t, m));
        }
    }
}
