//! Growth forecasting, health classification and anomaly detection for
//! Sengon dendrometer telemetry.
//!
//! Module boundaries follow the data flow: `db` fetches readings,
//! `features` derives model inputs, `ml` holds the numeric models and
//! `pipeline` trains, persists and serves them. Siblings reach each other
//! through the re-exports below.

pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ml;
pub mod models;
pub mod pipeline;

pub use config::{Config, GrowthModelConfig, PipelineConfig};
pub use db::{MemoryReadingSource, PgReadingSource, ReadingSource};
pub use error::PipelineError;
pub use models::{HealthLabel, SensorReading};
pub use pipeline::{PredictionReport, SengonPipeline, TrainingReport};
