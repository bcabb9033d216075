//! Column-wise normalization transforms.
//!
//! Both scalers are fitted on a `(samples, features)` matrix and keep one
//! offset/scale pair per column. A column with no spread gets scale 1 so
//! the transform stays finite and invertible.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

// ---

pub trait Scaler {
    // ---
    fn n_features(&self) -> usize;

    /// Apply the fitted transform.
    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>>;

    /// Undo [`Scaler::transform`].
    fn inverse_transform(&self, x: &Array2<f64>) -> Result<Array2<f64>>;
}

/// Maps each column onto `[0, 1]` using the fitted min and max.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    // ---
    min: Array1<f64>,
    scale: Array1<f64>,
}

/// Centres each column on its mean and divides by its population standard
/// deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    // ---
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl MinMaxScaler {
    // ---
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        // ---
        ensure!(x.nrows() > 0, "Cannot fit MinMaxScaler on an empty matrix");

        let min = x.fold_axis(Axis(0), f64::INFINITY, |acc, v| acc.min(*v));
        let max = x.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, v| acc.max(*v));
        let scale = (&max - &min).mapv(non_zero);

        Ok(Self { min, scale })
    }
}

impl StandardScaler {
    // ---
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        // ---
        ensure!(x.nrows() > 0, "Cannot fit StandardScaler on an empty matrix");

        let n = x.nrows() as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let var = (x - &mean).mapv(|v| v * v).sum_axis(Axis(0)) / n;
        let scale = var.mapv(|v| non_zero(v.sqrt()));

        Ok(Self { mean, scale })
    }
}

impl Scaler for MinMaxScaler {
    // ---
    fn n_features(&self) -> usize {
        self.min.len()
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self, x)?;
        Ok((x - &self.min) / &self.scale)
    }

    fn inverse_transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self, x)?;
        Ok(x * &self.scale + &self.min)
    }
}

impl Scaler for StandardScaler {
    // ---
    fn n_features(&self) -> usize {
        self.mean.len()
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self, x)?;
        Ok((x - &self.mean) / &self.scale)
    }

    fn inverse_transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self, x)?;
        Ok(x * &self.scale + &self.mean)
    }
}

/// Every fitted scaler the pipeline owns, keyed by purpose. Persisted as a
/// single artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalerBundle {
    // ---
    pub lstm_features: Option<MinMaxScaler>,
    pub lstm_targets: Option<MinMaxScaler>,
    pub rf_health: Option<StandardScaler>,
    pub anomaly: Option<StandardScaler>,
}

// ---

fn non_zero(v: f64) -> f64 {
    if v.abs() < f64::EPSILON {
        1.0
    } else {
        v
    }
}

fn check_width(scaler: &impl Scaler, x: &Array2<f64>) -> Result<()> {
    // ---
    ensure!(
        x.ncols() == scaler.n_features(),
        "Scaler fitted on {} features, got {}",
        scaler.n_features(),
        x.ncols()
    );
    Ok(())
}
