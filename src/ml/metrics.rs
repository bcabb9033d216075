//! Evaluation metrics for the regression and classification models.

use std::collections::BTreeMap;

use serde::Serialize;

// ---

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    // ---
    debug_assert_eq!(actual.len(), predicted.len());
    if actual.is_empty() {
        return 0.0;
    }
    let sum: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).abs()).sum();
    sum / actual.len() as f64
}

pub fn root_mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    // ---
    debug_assert_eq!(actual.len(), predicted.len());
    if actual.is_empty() {
        return 0.0;
    }
    let sum: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).powi(2)).sum();
    (sum / actual.len() as f64).sqrt()
}

/// Precision, recall and F1 for one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class metrics plus accuracy and macro/weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport<L: Ord> {
    pub per_class: BTreeMap<L, ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

impl<L: Ord + Clone> ClassificationReport<L> {
    // ---
    /// Build a report over every label seen in either slice. A ratio with a
    /// zero denominator counts as 0.
    pub fn new(actual: &[L], predicted: &[L]) -> Self {
        // ---
        debug_assert_eq!(actual.len(), predicted.len());

        let mut labels: Vec<L> = actual.iter().chain(predicted).cloned().collect();
        labels.sort();
        labels.dedup();

        let per_class: BTreeMap<L, ClassMetrics> = labels
            .into_iter()
            .map(|label| {
                let metrics = class_metrics(&label, actual, predicted);
                (label, metrics)
            })
            .collect();

        let correct = actual.iter().zip(predicted).filter(|(a, p)| a == p).count();
        let accuracy = ratio(correct, actual.len());

        let n_classes = per_class.len().max(1) as f64;
        let total: usize = per_class.values().map(|m| m.support).sum();

        let macro_avg = ClassMetrics {
            precision: per_class.values().map(|m| m.precision).sum::<f64>() / n_classes,
            recall: per_class.values().map(|m| m.recall).sum::<f64>() / n_classes,
            f1: per_class.values().map(|m| m.f1).sum::<f64>() / n_classes,
            support: total,
        };

        let weight = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            per_class.values().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
        };
        let weighted_avg = ClassMetrics {
            precision: weight(|m| m.precision),
            recall: weight(|m| m.recall),
            f1: weight(|m| m.f1),
            support: total,
        };

        Self {
            per_class,
            accuracy,
            macro_avg,
            weighted_avg,
        }
    }
}

fn class_metrics<L: PartialEq>(label: &L, actual: &[L], predicted: &[L]) -> ClassMetrics {
    // ---
    let mut tp = 0;
    let mut fp = 0;
    let mut fn_ = 0;
    for (a, p) in actual.iter().zip(predicted) {
        match (a == label, p == label) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ClassMetrics {
        precision,
        recall,
        f1,
        support: tp + fn_,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
