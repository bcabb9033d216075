//! Isolation forest outlier detector.
//!
//! Anomalies are isolated by fewer random axis-aligned cuts than normal
//! points. Each tree is grown on a sub-sample without replacement up to
//! `ceil(log2(sample_size))` levels; the anomaly score is
//! `2^(-E[h(x)] / c(sample_size))`.
//!
//! The decision threshold is fitted from the training data: the
//! `contamination` quantile of the training scores becomes the offset, so
//! roughly that fraction of training rows ends up flagged.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

// ---

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationParams {
    // ---
    pub n_estimators: usize,
    pub max_samples: usize,
    /// Expected share of outliers, in `(0, 0.5]`.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    // ---
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    // ---
    trees: Vec<IsolationTree>,
    sample_size: usize,
    n_features: usize,
    /// Subtracted from the raw score so that negative means outlier.
    offset: f64,
}

impl IsolationForest {
    // ---
    pub fn fit(x: &Array2<f64>, params: &IsolationParams) -> Result<Self> {
        // ---
        ensure!(x.nrows() > 0, "Cannot fit an isolation forest on zero samples");
        ensure!(
            params.contamination > 0.0 && params.contamination <= 0.5,
            "Contamination must be in (0, 0.5], got {}",
            params.contamination
        );

        let n = x.nrows();
        let sample_size = params.max_samples.min(n).max(1);
        let height_limit = (sample_size as f64).log2().ceil().max(0.0) as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators)
            .map(|_| {
                let sample = index::sample(&mut rng, n, sample_size).into_vec();
                let mut tree = IsolationTree { nodes: Vec::new() };
                tree.grow(x, sample, 0, height_limit, &mut rng);
                tree
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            n_features: x.ncols(),
            offset: 0.0,
        };

        let training_scores = forest.score_samples(x)?;
        forest.offset = percentile(&training_scores, params.contamination);
        Ok(forest)
    }

    /// Negated anomaly score per row; lower is more abnormal.
    pub fn score_samples(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
        // ---
        ensure!(
            x.ncols() == self.n_features,
            "Isolation forest fitted on {} features, got {}",
            self.n_features,
            x.ncols()
        );

        let norm = average_path_length(self.sample_size).max(f64::EPSILON);
        let n_trees = self.trees.len().max(1) as f64;

        Ok(x.rows()
            .into_iter()
            .map(|row| {
                let mean_depth = self.trees.iter().map(|t| t.path_length(row)).sum::<f64>() / n_trees;
                -(2.0_f64).powf(-mean_depth / norm)
            })
            .collect())
    }

    /// Shifted score: negative for outliers, positive for inliers.
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
        Ok(self.score_samples(x)?.into_iter().map(|s| s - self.offset).collect())
    }

    /// `true` for each row judged an outlier.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<bool>> {
        Ok(self.decision_function(x)?.into_iter().map(|d| d < 0.0).collect())
    }
}

impl IsolationTree {
    // ---
    fn grow(&mut self, x: &Array2<f64>, samples: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> usize {
        // ---
        if depth >= limit || samples.len() <= 1 {
            return self.push(Node::Leaf { size: samples.len() });
        }

        let mut features: Vec<usize> = (0..x.ncols()).collect();
        features.shuffle(rng);

        let range = features.into_iter().find_map(|f| {
            let (lo, hi) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = x[[i, f]];
                (lo.min(v), hi.max(v))
            });
            (hi > lo).then_some((f, lo, hi))
        });

        let Some((feature, lo, hi)) = range else {
            return self.push(Node::Leaf { size: samples.len() });
        };

        let threshold = rng.gen_range(lo..hi);
        let (left, right): (Vec<usize>, Vec<usize>) = samples.into_iter().partition(|&i| x[[i, feature]] <= threshold);

        let node = self.push(Node::Leaf { size: 0 });
        let left = self.grow(x, left, depth + 1, limit, rng);
        let right = self.grow(x, right, depth + 1, limit, rng);
        self.nodes[node] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        node
    }

    fn path_length(&self, row: ArrayView1<f64>) -> f64 {
        // ---
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    // ---
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated quantile, `q` in `[0, 1]`.
fn percentile(values: &[f64], q: f64) -> f64 {
    // ---
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use ndarray::array;

    fn cloud_with_outliers() -> Array2<f64> {
        // ---
        let mut rng = StdRng::seed_from_u64(3);
        let mut x = Array2::from_shape_fn((200, 3), |_| rng.gen_range(-1.0..1.0));
        x.row_mut(0).assign(&array![12.0, -12.0, 12.0]);
        x.row_mut(1).assign(&array![-15.0, 15.0, -15.0]);
        x
    }

    #[test]
    fn test_obvious_outliers_are_flagged() {
        // ---
        let x = cloud_with_outliers();
        let forest = IsolationForest::fit(&x, &IsolationParams::default()).unwrap();
        let flags = forest.predict(&x).unwrap();
        let scores = forest.decision_function(&x).unwrap();

        assert!(flags[0] && flags[1]);
        assert!(scores[0] < 0.0 && scores[1] < 0.0);
        assert!(!forest.predict(&array![[0.0, 0.0, 0.0]]).unwrap()[0]);
    }

    #[test]
    fn test_flag_share_tracks_contamination() {
        // ---
        let x = cloud_with_outliers();
        let forest = IsolationForest::fit(&x, &IsolationParams::default()).unwrap();
        let flagged = forest.predict(&x).unwrap().into_iter().filter(|f| *f).count();

        // About 10% of 200 rows
        assert!((15..=25).contains(&flagged), "flagged {}", flagged);
    }

    #[test]
    fn test_small_inputs_and_validation() {
        // ---
        let x = array![[1.0, 2.0]];
        assert!(IsolationForest::fit(&x, &IsolationParams::default()).is_ok());

        let bad = IsolationParams {
            contamination: 0.9,
            ..IsolationParams::default()
        };
        assert!(IsolationForest::fit(&x, &bad).is_err());
        assert!(IsolationForest::fit(&Array2::zeros((0, 2)), &IsolationParams::default()).is_err());
    }

    #[test]
    fn test_average_path_length() {
        // ---
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.244_770_920_116_851).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_interpolates() {
        // ---
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 0.0), 1.0);
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 1.0), 4.0);
        assert!((percentile(&[1.0, 2.0, 3.0, 4.0], 0.1) - 1.3).abs() < 1e-12);
    }
}
