//! Unsupervised outlier detection on the raw sensor columns.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;
use crate::ml::{IsolationForest, IsolationParams, Scaler, StandardScaler};
use crate::models::SensorReading;

// ---

pub const ANOMALY_COLUMNS: [&str; 5] = [
    "diameter_mm",
    "growth_rate_mm_per_hour",
    "temperature_c",
    "humidity_percent",
    "soil_moisture_percent",
];

#[derive(Debug, Clone)]
pub struct TrainedAnomaly {
    pub model: IsolationForest,
    pub scaler: StandardScaler,
    pub flagged: usize,
    pub rows: usize,
}

/// Per-row outcome for the complete rows of a batch, in input order.
/// Entry `i` of every vector describes the same reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyReport {
    /// Index of the scored reading in the input slice.
    pub rows: Vec<usize>,
    pub times: Vec<DateTime<Utc>>,
    /// Negative for outliers.
    pub scores: Vec<f64>,
    pub is_anomaly: Vec<bool>,
    pub anomaly_count: usize,
}

pub fn train_anomaly_model(readings: &[SensorReading], params: &IsolationParams) -> Result<TrainedAnomaly> {
    // ---
    let (_, x) = complete_rows(readings)?;
    let scaler = StandardScaler::fit(&x).context("Failed to fit anomaly scaler")?;
    let scaled = scaler.transform(&x)?;

    let model = IsolationForest::fit(&scaled, params)?;
    let flagged = model.predict(&scaled)?.into_iter().filter(|f| *f).count();
    info!(
        "Anomaly model flagged {} of {} training rows ({:.1}%)",
        flagged,
        x.nrows(),
        100.0 * flagged as f64 / x.nrows() as f64
    );

    Ok(TrainedAnomaly {
        model,
        scaler,
        flagged,
        rows: x.nrows(),
    })
}

pub fn score_readings(
    model: &IsolationForest,
    scaler: &StandardScaler,
    readings: &[SensorReading],
) -> Result<AnomalyReport> {
    // ---
    let (rows, x) = complete_rows(readings)?;
    let scores = model.decision_function(&scaler.transform(&x)?)?;
    let is_anomaly: Vec<bool> = scores.iter().map(|s| *s < 0.0).collect();
    let anomaly_count = is_anomaly.iter().filter(|f| **f).count();
    let times = rows.iter().map(|&i| readings[i].time).collect();

    Ok(AnomalyReport {
        rows,
        times,
        scores,
        is_anomaly,
        anomaly_count,
    })
}

/// Matrix of [`ANOMALY_COLUMNS`] for readings where all five are present,
/// with the input index of each kept reading.
fn complete_rows(readings: &[SensorReading]) -> Result<(Vec<usize>, Array2<f64>)> {
    // ---
    let (indices, rows): (Vec<usize>, Vec<[f64; 5]>) = readings
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            let row = [
                r.diameter_mm,
                r.growth_rate_mm_per_hour?,
                r.temperature_c?,
                r.humidity_percent?,
                r.soil_moisture_percent?,
            ];
            Some((i, row))
        })
        .unzip();

    if rows.is_empty() {
        return Err(PipelineError::NoCompleteRows(&ANOMALY_COLUMNS).into());
    }

    let x = Array2::from_shape_vec(
        (rows.len(), ANOMALY_COLUMNS.len()),
        rows.into_iter().flatten().collect(),
    )?;
    Ok((indices, x))
}
