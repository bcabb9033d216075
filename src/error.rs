//! Domain failures raised by the training and inference paths.
//!
//! Everything else (database, filesystem, JSON) travels as `anyhow::Error`
//! with context attached at the boundary where it happened.

use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum PipelineError {
    // ---
    #[error("insufficient data: need at least {needed} rows, got {got}")]
    InsufficientRows { needed: usize, got: usize },

    #[error("no sequences could be built (every device has fewer than {needed} readings)")]
    NoSequences { needed: usize },

    #[error("no labeled rows left after dropping unknown and incomplete rows")]
    NoLabeledRows,

    #[error("no complete rows for columns {0:?}")]
    NoCompleteRows(&'static [&'static str]),

    #[error("{0} model not loaded")]
    ModelNotLoaded(&'static str),

    #[error("scaler '{0}' not available")]
    ScalerMissing(&'static str),

    #[error("feature column mismatch: model expects {expected:?}, found unknown column '{found}'")]
    FeatureMismatch { expected: Vec<String>, found: String },

    #[error("no artifacts found in {0}")]
    ArtifactsMissing(String),
}
