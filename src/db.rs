//! Sensor history access.
//!
//! The pipeline reads through the [`ReadingSource`] trait so the same
//! orchestration code runs against PostgreSQL/TimescaleDB in production
//! and against in-memory readings in tests.

use anyhow::{Context, Result};
use chrono::Duration;
use sqlx::PgPool;
use tracing::debug;

use crate::models::SensorReading;

// ---

/// Anything that can hand back a window of recent readings, ordered by
/// `(device_id, time)` with `diameter_mm` always present.
#[allow(async_fn_in_trait)]
pub trait ReadingSource {
    async fn fetch_readings(&self, device_id: Option<&str>, hours: u32) -> Result<Vec<SensorReading>>;
}

/// Reads the `sensor_data` hypertable.
#[derive(Debug, Clone)]
pub struct PgReadingSource {
    pool: PgPool,
}

impl PgReadingSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const FETCH_READINGS_SQL: &str = r#"
    SELECT
        time::TIMESTAMPTZ                         AS time,
        device_id,
        diameter_mm::DOUBLE PRECISION             AS diameter_mm,
        growth_rate_mm_per_hour::DOUBLE PRECISION AS growth_rate_mm_per_hour,
        temperature_c::DOUBLE PRECISION           AS temperature_c,
        humidity_percent::DOUBLE PRECISION        AS humidity_percent,
        soil_moisture_percent::DOUBLE PRECISION   AS soil_moisture_percent,
        battery_voltage::DOUBLE PRECISION         AS battery_voltage,
        wifi_rssi::INTEGER                        AS wifi_rssi
    FROM sensor_data
    WHERE time >= NOW() - make_interval(hours => $1)
      AND diameter_mm IS NOT NULL
      AND ($2::TEXT IS NULL OR device_id = $2)
    ORDER BY device_id, time
"#;

impl ReadingSource for PgReadingSource {
    // ---
    async fn fetch_readings(&self, device_id: Option<&str>, hours: u32) -> Result<Vec<SensorReading>> {
        // ---
        let hours = i32::try_from(hours).context("Fetch window does not fit in an INTEGER")?;

        let rows = sqlx::query_as::<_, SensorReading>(FETCH_READINGS_SQL)
            .bind(hours)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch the last {} hours of sensor data", hours))?;

        debug!(
            "Fetched {} readings (device: {}, window: {}h)",
            rows.len(),
            device_id.unwrap_or("all"),
            hours
        );
        Ok(rows)
    }
}

/// Fixed set of readings held in memory.
///
/// The fetch window is anchored at the newest reading in the set rather
/// than the wall clock, so recorded data replays the same way every time.
#[derive(Debug, Clone, Default)]
pub struct MemoryReadingSource {
    readings: Vec<SensorReading>,
}

impl MemoryReadingSource {
    pub fn new(readings: Vec<SensorReading>) -> Self {
        Self { readings }
    }
}

impl ReadingSource for MemoryReadingSource {
    // ---
    async fn fetch_readings(&self, device_id: Option<&str>, hours: u32) -> Result<Vec<SensorReading>> {
        // ---
        let Some(newest) = self.readings.iter().map(|r| r.time).max() else {
            return Ok(Vec::new());
        };
        let since = newest - Duration::hours(i64::from(hours));

        let mut rows: Vec<SensorReading> = self
            .readings
            .iter()
            .filter(|r| r.time >= since)
            .filter(|r| device_id.map_or(true, |id| r.device_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.time.cmp(&b.time)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::fixtures::hourly_readings;

    #[test]
    fn test_fetch_query_casts_decoded_columns() {
        // ---
        for cast in [
            "time::TIMESTAMPTZ",
            "diameter_mm::DOUBLE PRECISION",
            "wifi_rssi::INTEGER",
        ] {
            assert!(FETCH_READINGS_SQL.contains(cast), "missing {}", cast);
        }
        assert!(FETCH_READINGS_SQL.contains("ORDER BY device_id, time"));
    }

    #[tokio::test]
    async fn test_memory_source_filters_device_and_window() {
        // ---
        let mut readings = hourly_readings("SENGON_002", 48);
        readings.extend(hourly_readings("SENGON_001", 48));
        let source = MemoryReadingSource::new(readings);

        let all = source.fetch_readings(None, 168).await.unwrap();
        assert_eq!(all.len(), 96);
        assert_eq!(all[0].device_id, "SENGON_001");
        assert!(all.windows(2).all(|w| (&w[0].device_id, w[0].time) <= (&w[1].device_id, w[1].time)));

        let one = source.fetch_readings(Some("SENGON_002"), 168).await.unwrap();
        assert_eq!(one.len(), 48);
        assert!(one.iter().all(|r| r.device_id == "SENGON_002"));

        // Newest reading is hour 47, so a 10 hour window keeps hours 37..=47
        let recent = source.fetch_readings(Some("SENGON_001"), 10).await.unwrap();
        assert_eq!(recent.len(), 11);
    }

    #[tokio::test]
    async fn test_memory_source_empty() {
        // ---
        let source = MemoryReadingSource::default();
        assert!(source.fetch_readings(None, 24).await.unwrap().is_empty());
    }
}
