//! On-disk persistence of trained models and scalers.
//!
//! Every artifact is a standalone JSON file inside the model directory.
//! Files are overwritten on each training run, and a model that fails to
//! retrain has its file removed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::ModelRegistry;
use crate::error::PipelineError;
use crate::ml::ScalerBundle;

// ---

pub const GROWTH_MODEL_FILE: &str = "lstm_growth_prediction.json";
pub const HEALTH_MODEL_FILE: &str = "rf_health_classification.json";
pub const ANOMALY_MODEL_FILE: &str = "isolation_forest_anomaly.json";
pub const FEATURE_COLUMNS_FILE: &str = "rf_feature_columns.json";
pub const SCALERS_FILE: &str = "scalers.json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    // ---
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Serialize `value` into `file`, creating the directory if needed.
    pub fn save<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        // ---
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create model directory {}", self.dir.display()))?;

        let path = self.path(file);
        let out = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(out);
        serde_json::to_writer(&mut writer, value)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {}", path.display()))?;

        debug!("Saved {}", path.display());
        Ok(())
    }

    /// `Ok(None)` when the file does not exist; an error when it exists but
    /// cannot be read or parsed.
    pub fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        // ---
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }

        let input = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let value = serde_json::from_reader(BufReader::new(input))
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Delete `file`; a file that is already gone is not an error.
    pub fn remove(&self, file: &str) -> Result<()> {
        // ---
        let path = self.path(file);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed stale artifact {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Read the whole artifact set into a fresh registry.
    ///
    /// The scaler bundle is mandatory; a missing model file leaves that
    /// model unset.
    pub fn load_registry(&self) -> Result<ModelRegistry> {
        // ---
        let scalers: ScalerBundle = self
            .load(SCALERS_FILE)?
            .ok_or_else(|| PipelineError::ArtifactsMissing(self.path(SCALERS_FILE).display().to_string()))?;

        let registry = ModelRegistry {
            growth: self.load(GROWTH_MODEL_FILE)?,
            health: self.load(HEALTH_MODEL_FILE)?,
            feature_columns: self.load(FEATURE_COLUMNS_FILE)?,
            anomaly: self.load(ANOMALY_MODEL_FILE)?,
            scalers,
        };

        info!(
            "Loaded artifacts from {} (growth: {}, health: {}, anomaly: {})",
            self.dir.display(),
            loaded(registry.growth.is_some()),
            loaded(registry.health.is_some()),
            loaded(registry.anomaly.is_some()),
        );
        Ok(registry)
    }
}

fn loaded(present: bool) -> &'static str {
    if present {
        "loaded"
    } else {
        "missing"
    }
}
