//! Random forest classifier built from CART trees.
//!
//! Each tree is grown on a bootstrap sample, picks the best Gini split
//! among a random subset of `sqrt(n_features)` columns at every node, and
//! stores the class distribution of its training samples at each leaf.
//! Class probabilities are the mean of the leaf distributions.
//!
//! Classes are dense indices `0..n_classes`; mapping them to labels is the
//! caller's job.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    // ---
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    // ---
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DecisionTree {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    // ---
    trees: Vec<DecisionTree>,
    n_classes: usize,
    n_features: usize,
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    y: &'a [usize],
    n_classes: usize,
    max_features: usize,
    params: &'a ForestParams,
    nodes: Vec<Node>,
}

impl RandomForestClassifier {
    // ---
    /// Fit on `x` (`samples x features`) with class indices `y`.
    pub fn fit(x: &Array2<f64>, y: &[usize], n_classes: usize, params: &ForestParams) -> Result<Self> {
        // ---
        ensure!(x.nrows() > 0, "Cannot fit a forest on zero samples");
        ensure!(x.nrows() == y.len(), "Got {} samples but {} labels", x.nrows(), y.len());
        ensure!(
            y.iter().all(|&c| c < n_classes),
            "Label index out of range for {} classes",
            n_classes
        );

        let n = x.nrows();
        let n_features = x.ncols();
        let max_features = ((n_features as f64).sqrt() as usize).max(1);
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators)
            .map(|_| {
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let mut builder = TreeBuilder {
                    x,
                    y,
                    n_classes,
                    max_features,
                    params,
                    nodes: Vec::new(),
                };
                builder.grow(sample, 0, &mut rng);
                DecisionTree { nodes: builder.nodes }
            })
            .collect();

        Ok(Self {
            trees,
            n_classes,
            n_features,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Mean leaf class distribution across trees, one row per sample.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        // ---
        ensure!(
            x.ncols() == self.n_features,
            "Forest fitted on {} features, got {}",
            self.n_features,
            x.ncols()
        );

        let mut proba = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for (i, row) in x.rows().into_iter().enumerate() {
            for tree in &self.trees {
                for (c, p) in tree.leaf_distribution(row).iter().enumerate() {
                    proba[[i, c]] += p;
                }
            }
        }
        let n_trees = self.trees.len().max(1) as f64;
        Ok(proba / n_trees)
    }

    /// Most probable class per sample. Ties go to the lower index.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        // ---
        let proba = self.predict_proba(x)?;
        Ok(proba.rows().into_iter().map(|row| argmax(row.iter().copied())).collect())
    }
}

impl DecisionTree {
    // ---
    fn leaf_distribution(&self, row: ArrayView1<f64>) -> &[f64] {
        // ---
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

impl TreeBuilder<'_> {
    // ---
    fn grow(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        // ---
        let counts = self.class_counts(&samples);
        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;

        if pure || depth >= self.params.max_depth || samples.len() < self.params.min_samples_split {
            return self.push_leaf(&counts);
        }

        let Some((feature, threshold)) = self.best_split(&samples, rng) else {
            return self.push_leaf(&counts);
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.x[[i, feature]] <= threshold);

        let node = self.nodes.len();
        self.nodes.push(Node::Leaf {
            distribution: Vec::new(),
        });
        let left = self.grow(left, depth + 1, rng);
        let right = self.grow(right, depth + 1, rng);
        self.nodes[node] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        node
    }

    /// Best `(feature, threshold)` by weighted Gini impurity, honouring
    /// `min_samples_leaf`. Features are tried in random order; the search
    /// stops once `max_features` of them have been examined and a split
    /// exists, so constant columns do not starve a node.
    fn best_split(&self, samples: &[usize], rng: &mut StdRng) -> Option<(usize, f64)> {
        // ---
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);

        let n = samples.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let total = self.class_counts(samples);

        let mut best: Option<(f64, usize, f64)> = None;
        let mut examined = 0;

        for feature in features {
            if examined >= self.max_features && best.is_some() {
                break;
            }
            examined += 1;

            let mut sorted: Vec<(f64, usize)> = samples.iter().map(|&i| (self.x[[i, feature]], self.y[i])).collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = vec![0usize; self.n_classes];
            for k in 1..n {
                left[sorted[k - 1].1] += 1;
                if k < min_leaf || n - k < min_leaf {
                    continue;
                }
                let (lo, hi) = (sorted[k - 1].0, sorted[k].0);
                if lo >= hi {
                    continue;
                }

                let right: Vec<usize> = total.iter().zip(&left).map(|(t, l)| t - l).collect();
                let score = (k as f64 * gini(&left, k) + (n - k) as f64 * gini(&right, n - k)) / n as f64;

                if best.map_or(true, |(s, _, _)| score < s) {
                    // Adjacent floats can round the midpoint up to `hi`
                    let mid = lo + (hi - lo) / 2.0;
                    let threshold = if mid >= hi { lo } else { mid };
                    best = Some((score, feature, threshold));
                }
            }
        }

        best.map(|(_, feature, threshold)| (feature, threshold))
    }

    fn class_counts(&self, samples: &[usize]) -> Vec<usize> {
        // ---
        let mut counts = vec![0usize; self.n_classes];
        for &i in samples {
            counts[self.y[i]] += 1;
        }
        counts
    }

    fn push_leaf(&mut self, counts: &[usize]) -> usize {
        // ---
        let total: usize = counts.iter().sum();
        let distribution = counts
            .iter()
            .map(|&c| if total == 0 { 0.0 } else { c as f64 / total as f64 })
            .collect();
        self.nodes.push(Node::Leaf { distribution });
        self.nodes.len() - 1
    }
}

fn gini(counts: &[usize], n: usize) -> f64 {
    // ---
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> usize {
    // ---
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}
