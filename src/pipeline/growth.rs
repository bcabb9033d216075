//! Diameter forecasting with the stacked LSTM.
//!
//! Training windows come from [`build_sequences`]; the forecast is
//! autoregressive, each predicted diameter becoming the last step of the
//! next input window while the environment columns stay at their last
//! observed values.

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GrowthModelConfig;
use crate::error::PipelineError;
use crate::features::sequences::{filled_matrix, N_SEQUENCE_FEATURES};
use crate::features::{build_sequences, prepare_sequences};
use crate::ml::metrics::{mean_absolute_error, root_mean_squared_error};
use crate::ml::split::shuffled_split;
use crate::ml::{LstmRegressor, MinMaxScaler, Scaler};
use crate::models::SensorReading;

// ---

/// Trained network plus the window length it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthModel {
    // ---
    pub sequence_length: usize,
    network: LstmRegressor,
}

/// Hold-out errors in millimetres after inverse scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowthMetrics {
    pub mae_mm: f64,
    pub rmse_mm: f64,
    pub epochs_run: usize,
    pub train_windows: usize,
    pub test_windows: usize,
}

/// Everything a growth training run produces.
#[derive(Debug, Clone)]
pub struct TrainedGrowth {
    pub model: GrowthModel,
    pub feature_scaler: MinMaxScaler,
    pub target_scaler: MinMaxScaler,
    pub metrics: GrowthMetrics,
}

pub fn train_growth_model(
    readings: &[SensorReading],
    cfg: &GrowthModelConfig,
    test_fraction: f64,
    seed: u64,
) -> Result<TrainedGrowth> {
    // ---
    let set = build_sequences(readings, cfg.sequence_length);
    if set.is_empty() {
        return Err(PipelineError::NoSequences {
            needed: cfg.sequence_length + 1,
        }
        .into());
    }
    info!("Built {} growth sequences of length {}", set.len(), cfg.sequence_length);

    let prepared = prepare_sequences(&set).context("Failed to scale growth sequences")?;
    let split = shuffled_split(prepared.targets.len(), test_fraction, seed);

    let train_x = prepared.windows.select(Axis(0), &split.train);
    let train_y: Vec<f64> = split.train.iter().map(|&i| prepared.targets[i]).collect();
    let test_x = prepared.windows.select(Axis(0), &split.test);
    let test_y: Vec<f64> = split.test.iter().map(|&i| prepared.targets[i]).collect();

    let mut network = LstmRegressor::new(
        N_SEQUENCE_FEATURES,
        &cfg.lstm_units,
        cfg.dense_units,
        cfg.dropout,
        cfg.recurrent_dropout,
        seed,
    );
    let summary = network.fit(&train_x, &train_y, &test_x, &test_y, &cfg.train_options(seed));
    info!(
        "Growth model stopped after {} epochs (best epoch {}, val loss {:.6})",
        summary.epochs_run, summary.best_epoch, summary.best_val_loss
    );

    // An empty hold-out falls back to the training windows
    let (eval_x, eval_y) = if test_y.is_empty() {
        (&train_x, &train_y)
    } else {
        (&test_x, &test_y)
    };
    let actual = inverse_targets(&prepared.target_scaler, eval_y)?;
    let predicted = inverse_targets(&prepared.target_scaler, &network.predict(eval_x))?;

    let metrics = GrowthMetrics {
        mae_mm: mean_absolute_error(&actual, &predicted),
        rmse_mm: root_mean_squared_error(&actual, &predicted),
        epochs_run: summary.epochs_run,
        train_windows: train_y.len(),
        test_windows: test_y.len(),
    };
    info!(
        "Growth model MAE: {:.4} mm, RMSE: {:.4} mm",
        metrics.mae_mm, metrics.rmse_mm
    );

    Ok(TrainedGrowth {
        model: GrowthModel {
            sequence_length: cfg.sequence_length,
            network,
        },
        feature_scaler: prepared.feature_scaler,
        target_scaler: prepared.target_scaler,
        metrics,
    })
}

impl GrowthModel {
    // ---
    /// Forecast `steps_ahead` diameters (mm) following `recent`, which
    /// should hold a single device's readings in time order.
    pub fn forecast(
        &self,
        recent: &[SensorReading],
        steps_ahead: usize,
        feature_scaler: &MinMaxScaler,
        target_scaler: &MinMaxScaler,
    ) -> Result<Vec<f64>> {
        // ---
        let len = self.sequence_length;
        if recent.len() < len {
            return Err(PipelineError::InsufficientRows {
                needed: len,
                got: recent.len(),
            }
            .into());
        }

        let rows: Vec<&SensorReading> = recent.iter().collect();
        let matrix = filled_matrix(&rows)
            .ok_or_else(|| anyhow::anyhow!("An environment column has no values in the recent readings"))?;
        let history = &matrix[matrix.len() - len..];

        let mut window: Vec<[f64; N_SEQUENCE_FEATURES]> = history
            .iter()
            .map(|step| scale_step(feature_scaler, step))
            .collect::<Result<_>>()?;
        let mut last_raw = history[len - 1];

        let mut forecast = Vec::with_capacity(steps_ahead);
        for _ in 0..steps_ahead {
            let input = Array3::from_shape_fn((1, len, N_SEQUENCE_FEATURES), |(_, t, f)| window[t][f]);
            let scaled = self.network.predict(&input);
            let diameter = inverse_targets(target_scaler, &scaled)?[0];
            forecast.push(diameter);

            last_raw[0] = diameter;
            window.remove(0);
            window.push(scale_step(feature_scaler, &last_raw)?);
        }

        Ok(forecast)
    }
}

fn scale_step(scaler: &MinMaxScaler, step: &[f64; N_SEQUENCE_FEATURES]) -> Result<[f64; N_SEQUENCE_FEATURES]> {
    // ---
    let row = Array2::from_shape_vec((1, N_SEQUENCE_FEATURES), step.to_vec())?;
    let scaled = scaler.transform(&row)?;
    let mut out = [0.0; N_SEQUENCE_FEATURES];
    for (o, v) in out.iter_mut().zip(scaled.iter()) {
        *o = *v;
    }
    Ok(out)
}

fn inverse_targets(scaler: &MinMaxScaler, values: &[f64]) -> Result<Vec<f64>> {
    // ---
    let column = Array2::from_shape_vec((values.len(), 1), values.to_vec())?;
    Ok(scaler.inverse_transform(&column)?.iter().copied().collect())
}
