//! Seeded train/validation index splits.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ---

/// Index sets produced by a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle `0..n` and hold out `ceil(n * test_fraction)` indices.
///
/// At least one index stays on the training side when `n > 0`.
pub fn shuffled_split(n: usize, test_fraction: f64, seed: u64) -> Split {
    // ---
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);

    let n_test = test_count(n, test_fraction);
    let train = indices.split_off(n_test);
    Split {
        train,
        test: indices,
    }
}

/// Split so each class keeps roughly the same share on both sides.
///
/// Classes with a single member go to the training side only.
pub fn stratified_split<L: Ord + Clone>(labels: &[L], test_fraction: f64, seed: u64) -> Split {
    // ---
    let mut rng = StdRng::seed_from_u64(seed);

    let mut by_class: BTreeMap<L, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        by_class.entry(label.clone()).or_default().push(i);
    }

    let mut split = Split {
        train: Vec::with_capacity(labels.len()),
        test: Vec::new(),
    };

    for (_, mut members) in by_class {
        members.shuffle(&mut rng);
        let n_test = if members.len() < 2 {
            0
        } else {
            ((members.len() as f64 * test_fraction).round() as usize).max(1)
        };
        let n_test = n_test.min(members.len() - 1);
        let train = members.split_off(n_test);
        split.test.extend(members);
        split.train.extend(train);
    }

    split.train.shuffle(&mut rng);
    split.test.shuffle(&mut rng);
    split
}

fn test_count(n: usize, test_fraction: f64) -> usize {
    // ---
    if n < 2 {
        return 0;
    }
    ((n as f64 * test_fraction).ceil() as usize).min(n - 1)
}
