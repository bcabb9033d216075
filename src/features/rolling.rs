//! Trailing-window statistics over series with gaps.
//!
//! Every function takes `Option<f64>` samples and returns one value per input
//! position, computed over the `window` samples ending at that position.
//! Missing samples are skipped, so a window may hold fewer observations than
//! its nominal size. A statistic that cannot be computed is `None`.

// ---

/// Trailing mean; needs at least one observation in the window.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    // ---
    (0..values.len())
        .map(|end| mean(observed(trailing(values, end, window))))
        .collect()
}

/// Trailing sample standard deviation (n - 1); needs two observations.
pub fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    // ---
    (0..values.len())
        .map(|end| sample_std(observed(trailing(values, end, window))))
        .collect()
}

/// Trailing Pearson correlation between two aligned series.
///
/// Only positions where both sides are present take part. Fewer than two
/// pairs, or a side with zero variance, yields `None`.
pub fn rolling_corr(a: &[Option<f64>], b: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    // ---
    debug_assert_eq!(a.len(), b.len());

    (0..a.len())
        .map(|end| {
            let pairs: Vec<(f64, f64)> = trailing(a, end, window)
                .iter()
                .zip(trailing(b, end, window))
                .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
                .collect();
            pearson(&pairs)
        })
        .collect()
}

/// Mean of the present samples of a whole series.
pub fn series_mean(values: &[Option<f64>]) -> Option<f64> {
    mean(observed(values))
}

/// Sample standard deviation of the present samples of a whole series.
pub fn series_std(values: &[Option<f64>]) -> Option<f64> {
    sample_std(observed(values))
}

// ---

fn trailing<T>(values: &[T], end: usize, window: usize) -> &[T] {
    let start = (end + 1).saturating_sub(window);
    &values[start..=end]
}

fn observed(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().flatten().copied().collect()
}

fn mean(values: Vec<f64>) -> Option<f64> {
    // ---
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sample_std(values: Vec<f64>) -> Option<f64> {
    // ---
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / (n - 1.0)).sqrt())
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    // ---
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_rolling_mean_uses_partial_windows() {
        // ---
        let out = rolling_mean(&some(&[1.0, 2.0, 3.0, 4.0]), 3);
        assert!(close(out[0], 1.0));
        assert!(close(out[1], 1.5));
        assert!(close(out[2], 2.0));
        assert!(close(out[3], 3.0));
    }

    #[test]
    fn test_rolling_mean_skips_gaps() {
        // ---
        let out = rolling_mean(&[None, Some(2.0), None, Some(4.0)], 2);
        assert_eq!(out[0], None);
        assert!(close(out[1], 2.0));
        assert!(close(out[2], 2.0));
        assert!(close(out[3], 4.0));
    }

    #[test]
    fn test_rolling_std_needs_two_samples() {
        // ---
        let out = rolling_std(&some(&[2.0, 4.0, 4.0, 4.0, 5.0]), 24);
        assert_eq!(out[0], None);
        assert!(close(out[1], 2.0_f64.sqrt()));
        // Sample variance of [2, 4, 4, 4, 5] is 4.8 / 4
        assert!(close(out[4], 1.2_f64.sqrt()));
    }

    #[test]
    fn test_rolling_corr_perfect_and_inverse() {
        // ---
        let a = some(&[1.0, 2.0, 3.0, 4.0]);
        let b = some(&[2.0, 4.0, 6.0, 8.0]);
        let c = some(&[8.0, 6.0, 4.0, 2.0]);

        let pos = rolling_corr(&a, &b, 24);
        let neg = rolling_corr(&a, &c, 24);

        assert_eq!(pos[0], None);
        assert!(close(pos[3], 1.0));
        assert!(close(neg[3], -1.0));
    }

    #[test]
    fn test_rolling_corr_constant_side_is_none() {
        // ---
        let a = some(&[1.0, 2.0, 3.0]);
        let flat = some(&[5.0, 5.0, 5.0]);
        assert!(rolling_corr(&a, &flat, 24).iter().all(Option::is_none));
    }

    #[test]
    fn test_series_stats() {
        // ---
        let values = [Some(1.0), None, Some(3.0)];
        assert!(close(series_mean(&values), 2.0));
        assert!(close(series_std(&values), 2.0_f64.sqrt()));
        assert_eq!(series_std(&[Some(1.0)]), None);
    }
}
