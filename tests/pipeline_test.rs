use std::path::Path;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};

use sengon_ml::ml::{ForestParams, IsolationParams};
use sengon_ml::pipeline::artifacts::{
    ANOMALY_MODEL_FILE, FEATURE_COLUMNS_FILE, GROWTH_MODEL_FILE, HEALTH_MODEL_FILE, SCALERS_FILE,
};
use sengon_ml::{GrowthModelConfig, MemoryReadingSource, PipelineConfig, PipelineError, SengonPipeline, SensorReading};

// ---

/// Hourly readings per device, with a daily temperature cycle
/// that pushes some rows out of the healthy band.
fn readings(devices: &[&str], hours: usize) -> Vec<SensorReading> {
    // ---
    let start = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();

    devices
        .iter()
        .enumerate()
        .flat_map(|(d, device)| {
            (0..hours).map(move |i| {
                let t = i as f64 + d as f64 * 3.0;
                SensorReading {
                    time: start + Duration::hours(i as i64),
                    device_id: device.to_string(),
                    diameter_mm: 145.0 + d as f64 + 0.009 * t + 0.04 * (t / 7.0).sin(),
                    growth_rate_mm_per_hour: Some(0.009 + 0.003 * (t / 4.0).cos()),
                    temperature_c: Some(27.0 + 7.0 * (t / 12.0).sin()),
                    humidity_percent: Some(72.0 + 12.0 * (t / 9.0).cos()),
                    soil_moisture_percent: Some(56.0 + 9.0 * (t / 20.0).sin()),
                    battery_voltage: Some(4.1 - 0.002 * t),
                    wifi_rssi: Some(-50 - (i % 7) as i32),
                }
            })
        })
        .collect()
}

fn tiny_config(model_dir: &Path) -> PipelineConfig {
    // ---
    PipelineConfig {
        model_dir: model_dir.to_path_buf(),
        growth: GrowthModelConfig {
            sequence_length: 12,
            lstm_units: vec![6, 4],
            dense_units: 4,
            epochs: 3,
            learning_rate: 0.01,
            patience: 2,
            ..GrowthModelConfig::default()
        },
        forest: ForestParams {
            n_estimators: 15,
            ..ForestParams::default()
        },
        isolation: IsolationParams {
            n_estimators: 30,
            ..IsolationParams::default()
        },
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn train_then_reload_and_predict() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let data = readings(&["SENGON_002", "SENGON_001"], 120);

    let mut trainer = SengonPipeline::new(MemoryReadingSource::new(data.clone()), tiny_config(dir.path()));
    let report = trainer.run_training_pipeline(None).await?;

    assert!(report.growth && report.health && report.anomaly, "report: {:?}", report);
    assert!(report.is_success());
    for file in [
        GROWTH_MODEL_FILE,
        HEALTH_MODEL_FILE,
        FEATURE_COLUMNS_FILE,
        ANOMALY_MODEL_FILE,
        SCALERS_FILE,
    ] {
        assert!(dir.path().join(file).exists(), "{} was not written", file);
    }

    // A fresh pipeline only sees what is on disk
    let mut predictor = SengonPipeline::new(MemoryReadingSource::new(data), tiny_config(dir.path()));
    let prediction = predictor.run_prediction(None, 6).await?;

    assert_eq!(prediction.device_id, "SENGON_001");
    // 24 hour window anchored at the newest reading is 25 hourly rows
    assert_eq!(prediction.readings, 25);

    let forecast = prediction.growth_forecast.expect("growth forecast");
    assert_eq!(forecast.len(), 6);
    assert!(forecast.iter().all(|d| d.is_finite()));

    let health = prediction.health.expect("health prediction");
    assert!(health.confidence > 0.0 && health.confidence <= 1.0);
    assert!(health.probabilities.contains_key(&health.prediction));

    let anomalies = prediction.anomalies.expect("anomaly report");
    assert_eq!(anomalies.scores.len(), 25);
    assert_eq!(anomalies.rows, (0..25).collect::<Vec<_>>());
    assert_eq!(anomalies.times.len(), 25);
    assert_eq!(
        anomalies.anomaly_count,
        anomalies.is_anomaly.iter().filter(|f| **f).count()
    );

    Ok(())
}

#[tokio::test]
async fn prediction_targets_requested_device() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let data = readings(&["SENGON_001", "SENGON_002"], 120);

    let mut pipeline = SengonPipeline::new(MemoryReadingSource::new(data), tiny_config(dir.path()));
    assert!(pipeline.run_training_pipeline(None).await?.is_success());

    let prediction = pipeline.run_prediction(Some("SENGON_002"), 3).await?;
    assert_eq!(prediction.device_id, "SENGON_002");
    assert_eq!(prediction.growth_forecast.map(|f| f.len()), Some(3));

    Ok(())
}

#[tokio::test]
async fn one_failed_model_still_counts_as_success() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let mut config = tiny_config(dir.path());
    // No device has enough history for a window this long
    config.growth.sequence_length = 500;

    let data = readings(&["SENGON_001"], 120);
    let mut pipeline = SengonPipeline::new(MemoryReadingSource::new(data), config);
    let report = pipeline.run_training_pipeline(None).await?;

    assert!(!report.growth);
    assert!(report.health && report.anomaly);
    assert_eq!(report.succeeded(), 2);
    assert!(report.is_success());
    assert!(!dir.path().join(GROWTH_MODEL_FILE).exists());

    let prediction = pipeline.run_prediction(None, 6).await?;
    assert!(prediction.growth_forecast.is_none());
    assert!(prediction.health.is_some());
    assert!(prediction.anomalies.is_some());

    Ok(())
}

#[tokio::test]
async fn failed_retrain_removes_earlier_model() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let data = readings(&["SENGON_001"], 120);

    let mut first = SengonPipeline::new(MemoryReadingSource::new(data.clone()), tiny_config(dir.path()));
    assert!(first.run_training_pipeline(None).await?.growth);
    assert!(dir.path().join(GROWTH_MODEL_FILE).exists());

    let mut config = tiny_config(dir.path());
    config.growth.sequence_length = 500;
    let mut second = SengonPipeline::new(MemoryReadingSource::new(data), config);
    let report = second.run_training_pipeline(None).await?;

    assert!(!report.growth && report.is_success());
    assert!(!dir.path().join(GROWTH_MODEL_FILE).exists());

    second.load_models()?;
    assert!(second.registry().growth.is_none());
    assert!(second.registry().scalers.lstm_features.is_none());
    assert!(second.registry().health.is_some());

    Ok(())
}

#[tokio::test]
async fn too_many_failed_models_fails_training() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let mut config = tiny_config(dir.path());
    config.growth.sequence_length = 500;

    // Without growth rates there are no labels and no complete anomaly rows
    let data: Vec<SensorReading> = readings(&["SENGON_001"], 120)
        .into_iter()
        .map(|r| SensorReading {
            growth_rate_mm_per_hour: None,
            ..r
        })
        .collect();

    let mut pipeline = SengonPipeline::new(MemoryReadingSource::new(data), config);
    let report = pipeline.run_training_pipeline(None).await?;

    assert_eq!(report.succeeded(), 0);
    assert!(!report.is_success());
    for file in [GROWTH_MODEL_FILE, HEALTH_MODEL_FILE, FEATURE_COLUMNS_FILE, ANOMALY_MODEL_FILE] {
        assert!(!dir.path().join(file).exists(), "{} was written", file);
    }

    Ok(())
}

#[tokio::test]
async fn too_few_rows_fails_training() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let data = readings(&["SENGON_001"], 60);

    let mut pipeline = SengonPipeline::new(MemoryReadingSource::new(data), tiny_config(dir.path()));
    let err = pipeline.run_training_pipeline(Some("SENGON_001")).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InsufficientRows { needed: 100, got: 60 })
    ));
    Ok(())
}

#[tokio::test]
async fn prediction_without_artifacts_fails() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let data = readings(&["SENGON_001"], 48);

    let mut pipeline = SengonPipeline::new(MemoryReadingSource::new(data), tiny_config(dir.path()));
    let err = pipeline.run_prediction(None, 24).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ArtifactsMissing(_))
    ));
    Ok(())
}
