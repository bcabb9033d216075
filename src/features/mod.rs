//! Feature engineering: rolling statistics, health labels and sequence
//! windows, all derived from raw [`SensorReading`](crate::SensorReading)s.

pub mod health;
pub mod labels;
pub mod rolling;
pub mod sequences;

pub use health::{build_features, FeatureColumn, FeatureRow};
pub use labels::{derive_label, derive_labels};
pub use sequences::{build_sequences, prepare_sequences, PreparedSequences, SequenceSet};
