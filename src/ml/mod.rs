//! Numeric building blocks: scalers, splits, metrics and the three model
//! families used by the pipeline.

pub mod forest;
pub mod isolation;
pub mod lstm;
pub mod metrics;
pub mod scaler;
pub mod split;

pub use forest::{ForestParams, RandomForestClassifier};
pub use isolation::{IsolationForest, IsolationParams};
pub use lstm::{FitSummary, LstmRegressor, TrainOptions};
pub use metrics::{ClassMetrics, ClassificationReport};
pub use scaler::{MinMaxScaler, Scaler, ScalerBundle, StandardScaler};
