//! Multi-model orchestration: fetch, train, persist, reload and predict.
//!
//! [`SengonPipeline`] owns the data source, the artifact store and the
//! in-memory [`ModelRegistry`]. The three models have independent
//! lifecycles: one failing to train never blocks the other two, and a
//! missing model only disables its own predictor.
//!
//! Public trainer and predictor methods never propagate errors. Failures
//! are logged and surface as `false` or `None`.

pub mod anomaly;
pub mod artifacts;
pub mod growth;
pub mod health;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::db::ReadingSource;
use crate::error::PipelineError;
use crate::ml::{IsolationForest, ScalerBundle};
use crate::models::{group_by_device, SensorReading};

pub use anomaly::AnomalyReport;
pub use artifacts::ArtifactStore;
pub use growth::GrowthModel;
pub use health::{HealthModel, HealthPrediction};

use artifacts::{ANOMALY_MODEL_FILE, FEATURE_COLUMNS_FILE, GROWTH_MODEL_FILE, HEALTH_MODEL_FILE, SCALERS_FILE};

// ---

/// Trained models currently available for inference.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    // ---
    pub growth: Option<GrowthModel>,
    pub health: Option<HealthModel>,
    /// Column names the health model was trained on, in order.
    pub feature_columns: Option<Vec<String>>,
    pub anomaly: Option<IsolationForest>,
    pub scalers: ScalerBundle,
}

/// Which models a training run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrainingReport {
    pub growth: bool,
    pub health: bool,
    pub anomaly: bool,
}

impl TrainingReport {
    pub fn succeeded(&self) -> usize {
        [self.growth, self.health, self.anomaly].into_iter().filter(|ok| *ok).count()
    }

    /// A run counts as successful when at least two of the three models
    /// trained.
    pub fn is_success(&self) -> bool {
        self.succeeded() >= 2
    }
}

/// Output of one prediction run for a single device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionReport {
    pub device_id: String,
    pub readings: usize,
    /// Forecast diameters (mm), one per hourly step.
    pub growth_forecast: Option<Vec<f64>>,
    pub health: Option<HealthPrediction>,
    pub anomalies: Option<AnomalyReport>,
}

pub struct SengonPipeline<S> {
    // ---
    source: S,
    config: PipelineConfig,
    store: ArtifactStore,
    registry: ModelRegistry,
}

impl<S: ReadingSource> SengonPipeline<S> {
    // ---
    pub fn new(source: S, config: PipelineConfig) -> Self {
        // ---
        let store = ArtifactStore::new(config.model_dir.clone());
        Self {
            source,
            config,
            store,
            registry: ModelRegistry::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Fetch the training window and train all three models.
    ///
    /// Fails outright when the window holds fewer than `min_training_rows`
    /// readings; otherwise returns which models trained. Each trained
    /// model is written out as soon as it is ready; the scaler bundle is
    /// written once at the end.
    pub async fn run_training_pipeline(&mut self, device_id: Option<&str>) -> Result<TrainingReport> {
        // ---
        info!("Starting ML training pipeline...");

        let readings = self
            .source
            .fetch_readings(device_id, self.config.train_window_hours)
            .await?;

        if readings.len() < self.config.min_training_rows {
            warn!(
                "Insufficient data for training. Need at least {} records, got {}.",
                self.config.min_training_rows,
                readings.len()
            );
            return Err(PipelineError::InsufficientRows {
                needed: self.config.min_training_rows,
                got: readings.len(),
            }
            .into());
        }
        info!("Fetched {} readings for training", readings.len());

        info!("Training LSTM model for growth prediction...");
        let growth = self.train_growth_model(&readings);

        info!("Training Random Forest for health classification...");
        let health = self.train_health_model(&readings);

        info!("Training anomaly detection model...");
        let anomaly = self.train_anomaly_model(&readings);

        let report = TrainingReport { growth, health, anomaly };
        if let Err(e) = self.store.save(SCALERS_FILE, &self.registry.scalers) {
            error!("Failed to save scalers: {:#}", e);
        } else {
            info!("All models and scalers saved to {}", self.store.dir().display());
        }

        info!(
            "Training pipeline completed. {}/3 models trained successfully.",
            report.succeeded()
        );
        Ok(report)
    }

    pub fn train_growth_model(&mut self, readings: &[SensorReading]) -> bool {
        // ---
        let result = growth::train_growth_model(
            readings,
            &self.config.growth,
            self.config.test_fraction,
            self.config.seed,
        )
        .and_then(|trained| {
            self.store.save(GROWTH_MODEL_FILE, &trained.model)?;
            Ok(trained)
        });

        match result {
            Ok(trained) => {
                self.registry.growth = Some(trained.model);
                self.registry.scalers.lstm_features = Some(trained.feature_scaler);
                self.registry.scalers.lstm_targets = Some(trained.target_scaler);
                info!("LSTM model trained and saved");
                true
            }
            Err(e) => {
                error!("Error training LSTM model: {:#}", e);
                self.registry.growth = None;
                self.registry.scalers.lstm_features = None;
                self.registry.scalers.lstm_targets = None;
                self.discard(&[GROWTH_MODEL_FILE]);
                false
            }
        }
    }

    pub fn train_health_model(&mut self, readings: &[SensorReading]) -> bool {
        // ---
        let result = health::train_health_model(
            readings,
            &self.config.forest,
            self.config.test_fraction,
            self.config.seed,
        )
        .and_then(|trained| {
            let names: Vec<String> = trained.feature_columns.iter().map(|c| c.name().to_string()).collect();
            self.store.save(HEALTH_MODEL_FILE, &trained.model)?;
            self.store.save(FEATURE_COLUMNS_FILE, &names)?;
            Ok((trained, names))
        });

        match result {
            Ok((trained, names)) => {
                self.registry.health = Some(trained.model);
                self.registry.feature_columns = Some(names);
                self.registry.scalers.rf_health = Some(trained.scaler);
                info!("Random Forest health model trained and saved");
                true
            }
            Err(e) => {
                error!("Error training Random Forest model: {:#}", e);
                self.registry.health = None;
                self.registry.feature_columns = None;
                self.registry.scalers.rf_health = None;
                self.discard(&[HEALTH_MODEL_FILE, FEATURE_COLUMNS_FILE]);
                false
            }
        }
    }

    pub fn train_anomaly_model(&mut self, readings: &[SensorReading]) -> bool {
        // ---
        let result = anomaly::train_anomaly_model(readings, &self.config.isolation).and_then(|trained| {
            self.store.save(ANOMALY_MODEL_FILE, &trained.model)?;
            Ok(trained)
        });

        match result {
            Ok(trained) => {
                self.registry.anomaly = Some(trained.model);
                self.registry.scalers.anomaly = Some(trained.scaler);
                info!("Anomaly detection model trained and saved");
                true
            }
            Err(e) => {
                error!("Error training anomaly detection model: {:#}", e);
                self.registry.anomaly = None;
                self.registry.scalers.anomaly = None;
                self.discard(&[ANOMALY_MODEL_FILE]);
                false
            }
        }
    }

    /// Delete a failed model's artifacts so an earlier run's copy is not
    /// reloaded without its scaler.
    fn discard(&self, files: &[&str]) {
        // ---
        for file in files {
            if let Err(e) = self.store.remove(file) {
                error!("Failed to remove stale artifact: {:#}", e);
            }
        }
    }

    /// Replace the registry with the artifacts on disk. On error the
    /// current registry is left untouched.
    pub fn load_models(&mut self) -> Result<()> {
        // ---
        self.registry = self.store.load_registry()?;
        Ok(())
    }

    /// Forecast `steps_ahead` hourly diameters (mm) after `recent`.
    pub fn predict_growth(&self, recent: &[SensorReading], steps_ahead: usize) -> Option<Vec<f64>> {
        // ---
        soften("growth prediction", || {
            let model = self
                .registry
                .growth
                .as_ref()
                .ok_or(PipelineError::ModelNotLoaded("LSTM"))?;
            let scalers = &self.registry.scalers;
            let features = scalers
                .lstm_features
                .as_ref()
                .ok_or(PipelineError::ScalerMissing("lstm_features"))?;
            let targets = scalers
                .lstm_targets
                .as_ref()
                .ok_or(PipelineError::ScalerMissing("lstm_targets"))?;
            model.forecast(recent, steps_ahead, features, targets)
        })
    }

    /// Health state of the latest reading in `recent`.
    pub fn predict_health(&self, recent: &[SensorReading]) -> Option<HealthPrediction> {
        // ---
        soften("health prediction", || {
            let model = self
                .registry
                .health
                .as_ref()
                .ok_or(PipelineError::ModelNotLoaded("Random Forest health"))?;
            let names = self
                .registry
                .feature_columns
                .as_ref()
                .ok_or_else(|| PipelineError::ArtifactsMissing(FEATURE_COLUMNS_FILE.to_string()))?;
            let scaler = self
                .registry
                .scalers
                .rf_health
                .as_ref()
                .ok_or(PipelineError::ScalerMissing("rf_health"))?;
            let columns = health::resolve_columns(names)?;
            model.classify_latest(recent, scaler, &columns)
        })
    }

    /// Outlier scores and flags for the complete rows of `recent`.
    pub fn detect_anomalies(&self, recent: &[SensorReading]) -> Option<AnomalyReport> {
        // ---
        soften("anomaly detection", || {
            let model = self
                .registry
                .anomaly
                .as_ref()
                .ok_or(PipelineError::ModelNotLoaded("Anomaly detection"))?;
            let scaler = self
                .registry
                .scalers
                .anomaly
                .as_ref()
                .ok_or(PipelineError::ScalerMissing("anomaly"))?;
            anomaly::score_readings(model, scaler, recent)
        })
    }

    /// Load the artifacts, fetch the prediction window and run all three
    /// predictors for one device: `device_id` if given, else the first
    /// device in the window.
    pub async fn run_prediction(&mut self, device_id: Option<&str>, steps_ahead: usize) -> Result<PredictionReport> {
        // ---
        self.load_models()?;

        let readings = self
            .source
            .fetch_readings(device_id, self.config.predict_window_hours)
            .await?;

        let Some((device, rows)) = group_by_device(&readings).into_iter().next() else {
            warn!("No readings in the last {} hours", self.config.predict_window_hours);
            return Err(PipelineError::InsufficientRows { needed: 1, got: 0 }.into());
        };
        let recent: Vec<SensorReading> = rows.into_iter().cloned().collect();
        info!("Running predictions for {} on {} readings", device, recent.len());

        Ok(PredictionReport {
            growth_forecast: self.predict_growth(&recent, steps_ahead),
            health: self.predict_health(&recent),
            anomalies: self.detect_anomalies(&recent),
            readings: recent.len(),
            device_id: device,
        })
    }
}

/// Run `f`, logging and discarding any error.
fn soften<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
    // ---
    match f() {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Error in {}: {:#}", what, e);
            None
        }
    }
}
