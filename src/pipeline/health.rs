//! Health-state classification with the random forest.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::features::{build_features, derive_labels, FeatureColumn};
use crate::ml::forest::argmax;
use crate::ml::split::stratified_split;
use crate::ml::{ClassificationReport, ForestParams, RandomForestClassifier, Scaler, StandardScaler};
use crate::models::{HealthLabel, SensorReading};

// ---

/// Forest plus the label behind each of its class indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthModel {
    // ---
    /// Sorted; index `i` is forest class `i`.
    pub classes: Vec<HealthLabel>,
    forest: RandomForestClassifier,
}

/// Everything a health training run produces.
#[derive(Debug, Clone)]
pub struct TrainedHealth {
    pub model: HealthModel,
    pub scaler: StandardScaler,
    pub feature_columns: Vec<FeatureColumn>,
    pub report: ClassificationReport<HealthLabel>,
}

/// Result of classifying the latest reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthPrediction {
    pub prediction: HealthLabel,
    pub probabilities: BTreeMap<HealthLabel, f64>,
    pub confidence: f64,
}

pub fn train_health_model(
    readings: &[SensorReading],
    params: &ForestParams,
    test_fraction: f64,
    seed: u64,
) -> Result<TrainedHealth> {
    // ---
    let rows = build_features(readings);
    let labels = derive_labels(&rows);
    let columns = FeatureColumn::ALL.to_vec();

    let (vectors, kept_labels): (Vec<Vec<f64>>, Vec<HealthLabel>) = rows
        .iter()
        .zip(labels)
        .filter(|(_, label)| *label != HealthLabel::Unknown)
        .filter_map(|(row, label)| row.vector(&columns).map(|v| (v, label)))
        .unzip();

    if vectors.is_empty() {
        return Err(PipelineError::NoLabeledRows.into());
    }
    debug!("{} of {} rows usable for health training", vectors.len(), rows.len());

    let mut classes = kept_labels.clone();
    classes.sort();
    classes.dedup();
    let y: Vec<usize> = kept_labels
        .iter()
        .filter_map(|label| classes.binary_search(label).ok())
        .collect();

    let x = Array2::from_shape_vec(
        (vectors.len(), columns.len()),
        vectors.into_iter().flatten().collect(),
    )?;
    let scaler = StandardScaler::fit(&x).context("Failed to fit health feature scaler")?;
    let x = scaler.transform(&x)?;

    let split = stratified_split(&kept_labels, test_fraction, seed);
    let train_x = x.select(Axis(0), &split.train);
    let train_y: Vec<usize> = split.train.iter().map(|&i| y[i]).collect();

    let forest = RandomForestClassifier::fit(&train_x, &train_y, classes.len(), params)?;

    let test_x = x.select(Axis(0), &split.test);
    let actual: Vec<HealthLabel> = split.test.iter().map(|&i| kept_labels[i]).collect();
    let predicted: Vec<HealthLabel> = forest
        .predict(&test_x)?
        .into_iter()
        .map(|c| classes[c])
        .collect();
    let report = ClassificationReport::new(&actual, &predicted);
    log_report(&report);

    Ok(TrainedHealth {
        model: HealthModel { classes, forest },
        scaler,
        feature_columns: columns,
        report,
    })
}

/// Resolve persisted column names against the known feature columns.
pub fn resolve_columns(names: &[String]) -> Result<Vec<FeatureColumn>> {
    // ---
    names
        .iter()
        .map(|name| {
            name.parse::<FeatureColumn>().map_err(|_| {
                anyhow::Error::from(PipelineError::FeatureMismatch {
                    expected: names.to_vec(),
                    found: name.clone(),
                })
            })
        })
        .collect()
}

impl HealthModel {
    // ---
    /// Classify the most recent row of `recent`.
    pub fn classify_latest(
        &self,
        recent: &[SensorReading],
        scaler: &StandardScaler,
        columns: &[FeatureColumn],
    ) -> Result<HealthPrediction> {
        // ---
        let rows = build_features(recent);
        let latest = rows.last().ok_or(PipelineError::InsufficientRows { needed: 1, got: 0 })?;

        let values = columns
            .iter()
            .map(|&c| {
                latest
                    .value(c)
                    .ok_or_else(|| anyhow::anyhow!("Latest reading has no value for feature '{}'", c))
            })
            .collect::<Result<Vec<f64>>>()?;

        let x = scaler.transform(&Array2::from_shape_vec((1, values.len()), values)?)?;
        let proba = self.forest.predict_proba(&x)?;
        let row = proba.row(0);

        let best = argmax(row.iter().copied());
        let probabilities = self.classes.iter().copied().zip(row.iter().copied()).collect();

        Ok(HealthPrediction {
            prediction: self.classes[best],
            probabilities,
            confidence: row[best],
        })
    }
}

fn log_report(report: &ClassificationReport<HealthLabel>) {
    // ---
    info!("Health classification report:");
    for (label, m) in &report.per_class {
        info!(
            "  {:<10} precision {:.3}  recall {:.3}  f1 {:.3}  support {}",
            label.as_str(),
            m.precision,
            m.recall,
            m.f1,
            m.support
        );
    }
    info!("  accuracy   {:.3}", report.accuracy);
    info!(
        "  macro avg  precision {:.3}  recall {:.3}  f1 {:.3}",
        report.macro_avg.precision, report.macro_avg.recall, report.macro_avg.f1
    );
    info!(
        "  weighted   precision {:.3}  recall {:.3}  f1 {:.3}",
        report.weighted_avg.precision, report.weighted_avg.recall, report.weighted_avg.f1
    );
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::fixtures::hourly_readings;

    fn small_forest() -> ForestParams {
        ForestParams {
            n_estimators: 15,
            ..ForestParams::default()
        }
    }

    #[test]
    fn test_training_keeps_only_labeled_complete_rows() {
        // ---
        let readings = hourly_readings("SENGON_001", 120);
        let trained = train_health_model(&readings, &small_forest(), 0.2, 42).unwrap();

        assert_eq!(trained.feature_columns.len(), FeatureColumn::ALL.len());
        assert!(!trained.model.classes.contains(&HealthLabel::Unknown));
        assert!(trained.model.classes.windows(2).all(|w| w[0] < w[1]));
        assert!(trained.report.accuracy > 0.0);
    }

    #[test]
    fn test_no_labeled_rows_is_an_error() {
        // ---
        let mut readings = hourly_readings("SENGON_001", 30);
        for r in readings.iter_mut() {
            r.growth_rate_mm_per_hour = None;
        }
        let err = train_health_model(&readings, &small_forest(), 0.2, 42).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::NoLabeledRows)));
    }

    #[test]
    fn test_prediction_probabilities_cover_every_class() {
        // ---
        let readings = hourly_readings("SENGON_001", 120);
        let trained = train_health_model(&readings, &small_forest(), 0.2, 42).unwrap();

        let prediction = trained
            .model
            .classify_latest(&readings[90..], &trained.scaler, &trained.feature_columns)
            .unwrap();

        assert_eq!(prediction.probabilities.len(), trained.model.classes.len());
        let total: f64 = prediction.probabilities.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(prediction.probabilities[&prediction.prediction], prediction.confidence);
    }

    #[test]
    fn test_single_reading_lacks_std_features() {
        // ---
        let readings = hourly_readings("SENGON_001", 120);
        let trained = train_health_model(&readings, &small_forest(), 0.2, 42).unwrap();

        // A lone reading has no sample standard deviation
        assert!(trained
            .model
            .classify_latest(&readings[..1], &trained.scaler, &trained.feature_columns)
            .is_err());
    }

    #[test]
    fn test_unknown_column_name_is_a_mismatch() {
        // ---
        let names = vec!["diameter_mm".to_string(), "leaf_area".to_string()];
        let err = resolve_columns(&names).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::FeatureMismatch { found, .. }) => assert_eq!(found, "leaf_area"),
            other => panic!("unexpected error: {:?}", other),
        }

        let ok = resolve_columns(&["diameter_mm".to_string(), "temp_stress".to_string()]).unwrap();
        assert_eq!(ok, vec![FeatureColumn::DiameterMm, FeatureColumn::TempStress]);
    }
}
