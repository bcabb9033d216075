//! Sliding windows for the growth sequence model.

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use tracing::{debug, warn};

use crate::ml::scaler::{MinMaxScaler, Scaler};
use crate::models::{group_by_device, SensorReading};

// ---

/// Columns of each timestep, in order. Diameter must stay first: the
/// forecaster overwrites column 0 with its own predictions.
pub const SEQUENCE_COLUMNS: [&str; 4] = [
    "diameter_mm",
    "temperature_c",
    "humidity_percent",
    "soil_moisture_percent",
];

pub const N_SEQUENCE_FEATURES: usize = SEQUENCE_COLUMNS.len();

/// Windows and targets before scaling.
#[derive(Debug, Clone)]
pub struct SequenceSet {
    /// `(windows, sequence_length, features)`
    pub windows: Array3<f64>,
    /// Diameter immediately after each window.
    pub targets: Vec<f64>,
}

/// Scaled windows plus the scalers fitted to produce them.
#[derive(Debug, Clone)]
pub struct PreparedSequences {
    pub windows: Array3<f64>,
    pub targets: Vec<f64>,
    pub feature_scaler: MinMaxScaler,
    pub target_scaler: MinMaxScaler,
}

impl SequenceSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Build every window of `sequence_length` steps for every device with at
/// least `sequence_length + 1` readings.
pub fn build_sequences(readings: &[SensorReading], sequence_length: usize) -> SequenceSet {
    // ---
    let mut rows: Vec<f64> = Vec::new();
    let mut targets: Vec<f64> = Vec::new();

    for (device_id, device_rows) in group_by_device(readings) {
        if device_rows.len() <= sequence_length {
            debug!(
                "Device {} has {} readings, needs {} for a sequence",
                device_id,
                device_rows.len(),
                sequence_length + 1
            );
            continue;
        }

        let Some(matrix) = filled_matrix(&device_rows) else {
            warn!("Device {} has a sequence column with no values, skipping", device_id);
            continue;
        };

        for start in 0..(matrix.len() - sequence_length) {
            for step in &matrix[start..start + sequence_length] {
                rows.extend_from_slice(step);
            }
            targets.push(matrix[start + sequence_length][0]);
        }
    }

    let windows = Array3::from_shape_vec((targets.len(), sequence_length, N_SEQUENCE_FEATURES), rows)
        .unwrap_or_else(|_| Array3::zeros((0, sequence_length, N_SEQUENCE_FEATURES)));

    SequenceSet { windows, targets }
}

/// Fit min-max scalers on the windows (per column) and the targets, and
/// return the scaled data.
pub fn prepare_sequences(set: &SequenceSet) -> Result<PreparedSequences> {
    // ---
    let (n, len, width) = set.windows.dim();
    let flat = flatten(&set.windows);

    let feature_scaler = MinMaxScaler::fit(&flat)?;
    let scaled = feature_scaler.transform(&flat)?;
    let windows = Array3::from_shape_vec((n, len, width), scaled.iter().copied().collect())?;

    let target_matrix = Array2::from_shape_vec((set.targets.len(), 1), set.targets.clone())?;
    let target_scaler = MinMaxScaler::fit(&target_matrix)?;
    let targets = target_scaler.transform(&target_matrix)?.iter().copied().collect();

    Ok(PreparedSequences {
        windows,
        targets,
        feature_scaler,
        target_scaler,
    })
}

/// Per-device matrix of the sequence columns. Gaps in the environment
/// columns are forward- then back-filled; `None` if a column is empty.
pub fn filled_matrix(rows: &[&SensorReading]) -> Option<Vec<[f64; N_SEQUENCE_FEATURES]>> {
    // ---
    let temperature = fill_gaps(rows.iter().map(|r| r.temperature_c).collect())?;
    let humidity = fill_gaps(rows.iter().map(|r| r.humidity_percent).collect())?;
    let soil = fill_gaps(rows.iter().map(|r| r.soil_moisture_percent).collect())?;

    Some(
        rows.iter()
            .enumerate()
            .map(|(i, r)| [r.diameter_mm, temperature[i], humidity[i], soil[i]])
            .collect(),
    )
}

/// Collapse `(n, len, width)` windows into `(n * len, width)` rows.
pub fn flatten(windows: &Array3<f64>) -> Array2<f64> {
    // ---
    let (n, len, width) = windows.dim();
    let mut flat = Array2::zeros((n * len, width));
    for (i, window) in windows.axis_iter(Axis(0)).enumerate() {
        flat.slice_mut(ndarray::s![i * len..(i + 1) * len, ..]).assign(&window);
    }
    flat
}

fn fill_gaps(values: Vec<Option<f64>>) -> Option<Vec<f64>> {
    // ---
    let first = values.iter().flatten().copied().next()?;
    let mut last = first;
    Some(
        values
            .into_iter()
            .map(|v| {
                if let Some(v) = v {
                    last = v;
                }
                last
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::fixtures::hourly_readings;

    #[test]
    fn test_short_device_yields_no_windows() {
        // ---
        let set = build_sequences(&hourly_readings("SENGON_001", 72), 72);
        assert!(set.is_empty());
        assert_eq!(set.windows.dim(), (0, 72, 4));
    }

    #[test]
    fn test_minimum_device_yields_one_window() {
        // ---
        let readings = hourly_readings("SENGON_001", 73);
        let set = build_sequences(&readings, 72);

        assert_eq!(set.len(), 1);
        assert_eq!(set.windows[[0, 0, 0]], readings[0].diameter_mm);
        assert_eq!(set.windows[[0, 71, 0]], readings[71].diameter_mm);
        assert_eq!(set.targets[0], readings[72].diameter_mm);
    }

    #[test]
    fn test_windows_never_cross_devices() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 80);
        readings.extend(hourly_readings("SENGON_002", 50));
        readings.extend(hourly_readings("SENGON_003", 75));

        let set = build_sequences(&readings, 72);

        // 8 from the first device, none from the second, 3 from the third
        assert_eq!(set.len(), 11);
    }

    #[test]
    fn test_gaps_are_filled_within_device() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 4);
        readings[0].temperature_c = None;
        readings[2].temperature_c = None;
        let rows: Vec<&SensorReading> = readings.iter().collect();

        let matrix = filled_matrix(&rows).unwrap();

        assert_eq!(matrix[0][1], readings[1].temperature_c.unwrap());
        assert_eq!(matrix[2][1], readings[1].temperature_c.unwrap());
    }

    #[test]
    fn test_empty_column_drops_device() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 80);
        for r in readings.iter_mut() {
            r.humidity_percent = None;
        }
        assert!(build_sequences(&readings, 72).is_empty());
    }

    #[test]
    fn test_prepared_sequences_are_scaled_and_invertible() {
        // ---
        let readings = hourly_readings("SENGON_001", 100);
        let set = build_sequences(&readings, 72);
        let prepared = prepare_sequences(&set).unwrap();

        assert!(prepared.windows.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(prepared.targets.iter().all(|v| (0.0..=1.0).contains(v)));

        let scaled = Array2::from_shape_vec((prepared.targets.len(), 1), prepared.targets.clone()).unwrap();
        let restored = prepared.target_scaler.inverse_transform(&scaled).unwrap();
        for (r, t) in restored.iter().zip(&set.targets) {
            assert!((r - t).abs() < 1e-9);
        }
    }
}
