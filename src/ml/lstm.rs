//! Stacked LSTM regressor trained with backpropagation through time.
//!
//! Layout: `n` LSTM layers (all but the last return their full sequence),
//! a ReLU dense layer, dropout, and a single linear output unit. Trained on
//! mean squared error with Adam and early stopping on validation loss.
//!
//! Gate order inside the packed weight matrices is input, forget, cell,
//! output. Biases are kept as `(1, n)` matrices so every parameter is an
//! `Array2` and the optimizer can treat them uniformly.

use ndarray::{s, Array2, Array3, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---

const PREDICT_CHUNK: usize = 64;

/// Optimisation settings for [`LstmRegressor::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOptions {
    // ---
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    pub seed: u64,
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub stopped_early: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LstmLayer {
    // ---
    /// `(input, 4 * units)`
    w: Array2<f64>,
    /// `(units, 4 * units)`
    u: Array2<f64>,
    /// `(1, 4 * units)`
    b: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DenseLayer {
    // ---
    w: Array2<f64>,
    b: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmRegressor {
    // ---
    lstm: Vec<LstmLayer>,
    hidden: DenseLayer,
    output: DenseLayer,
    dropout: f64,
    recurrent_dropout: f64,
}

// Intermediate values of one LSTM timestep, kept for the backward pass.
struct StepCache {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    tanh_c: Array2<f64>,
}

struct LayerCache {
    steps: Vec<StepCache>,
    input_mask: Option<Array2<f64>>,
    recurrent_mask: Option<Array2<f64>>,
}

struct ForwardCache {
    layers: Vec<LayerCache>,
    last: Array2<f64>,
    hidden_pre: Array2<f64>,
    dropout_mask: Option<Array2<f64>>,
    dropped: Array2<f64>,
}

impl LstmLayer {
    // ---
    fn new(input: usize, units: usize, rng: &mut StdRng) -> Self {
        // ---
        let mut b = Array2::<f64>::zeros((1, 4 * units));
        // Forget gate starts open
        b.slice_mut(s![.., units..2 * units]).fill(1.0);

        Self {
            w: glorot(input, 4 * units, rng),
            u: glorot(units, 4 * units, rng),
            b,
        }
    }

    fn units(&self) -> usize {
        self.u.nrows()
    }

    fn forward(
        &self,
        xs: &[Array2<f64>],
        input_mask: Option<&Array2<f64>>,
        recurrent_mask: Option<&Array2<f64>>,
    ) -> (Vec<Array2<f64>>, Vec<StepCache>) {
        // ---
        let batch = xs.first().map_or(0, |x| x.nrows());
        let h = self.units();

        let mut h_t = Array2::<f64>::zeros((batch, h));
        let mut c_t = Array2::<f64>::zeros((batch, h));
        let mut outputs = Vec::with_capacity(xs.len());
        let mut steps = Vec::with_capacity(xs.len());

        for x in xs {
            let x_in = match input_mask {
                Some(m) => x * m,
                None => x.clone(),
            };
            let h_in = match recurrent_mask {
                Some(m) => &h_t * m,
                None => h_t.clone(),
            };

            let z = x_in.dot(&self.w) + h_in.dot(&self.u) + &self.b;
            let i = z.slice(s![.., 0..h]).mapv(sigmoid);
            let f = z.slice(s![.., h..2 * h]).mapv(sigmoid);
            let g = z.slice(s![.., 2 * h..3 * h]).mapv(f64::tanh);
            let o = z.slice(s![.., 3 * h..]).mapv(sigmoid);

            let c = &f * &c_t + &i * &g;
            let tanh_c = c.mapv(f64::tanh);
            h_t = &o * &tanh_c;
            outputs.push(h_t.clone());

            steps.push(StepCache {
                x: x_in,
                h_prev: h_in,
                c_prev: std::mem::replace(&mut c_t, c),
                i,
                f,
                g,
                o,
                tanh_c,
            });
        }

        (outputs, steps)
    }

    /// Accumulates parameter gradients into `grad` and returns the gradient
    /// with respect to each input timestep.
    fn backward(&self, cache: &LayerCache, d_outputs: &[Array2<f64>], grad: &mut LstmLayer) -> Vec<Array2<f64>> {
        // ---
        let h = self.units();
        let batch = d_outputs.first().map_or(0, |d| d.nrows());

        let mut dh_next = Array2::<f64>::zeros((batch, h));
        let mut dc_next = Array2::<f64>::zeros((batch, h));
        let mut d_inputs = vec![Array2::zeros((0, 0)); cache.steps.len()];

        for t in (0..cache.steps.len()).rev() {
            let step = &cache.steps[t];

            let dh = &d_outputs[t] + &dh_next;
            let d_o = &dh * &step.tanh_c;
            let dc = &dh * &step.o * &step.tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;

            let d_i = &dc * &step.g;
            let d_g = &dc * &step.i;
            let d_f = &dc * &step.c_prev;
            dc_next = &dc * &step.f;

            let mut dz = Array2::<f64>::zeros((batch, 4 * h));
            dz.slice_mut(s![.., 0..h]).assign(&(&d_i * &step.i.mapv(sigmoid_grad)));
            dz.slice_mut(s![.., h..2 * h]).assign(&(&d_f * &step.f.mapv(sigmoid_grad)));
            dz.slice_mut(s![.., 2 * h..3 * h]).assign(&(&d_g * &step.g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![.., 3 * h..]).assign(&(&d_o * &step.o.mapv(sigmoid_grad)));

            grad.w += &step.x.t().dot(&dz);
            grad.u += &step.h_prev.t().dot(&dz);
            grad.b += &dz.sum_axis(Axis(0)).insert_axis(Axis(0));

            let mut dx = dz.dot(&self.w.t());
            if let Some(m) = &cache.input_mask {
                dx *= m;
            }
            let mut dh_prev = dz.dot(&self.u.t());
            if let Some(m) = &cache.recurrent_mask {
                dh_prev *= m;
            }

            dh_next = dh_prev;
            d_inputs[t] = dx;
        }

        d_inputs
    }

    fn zeros_like(&self) -> Self {
        Self {
            w: Array2::zeros(self.w.raw_dim()),
            u: Array2::zeros(self.u.raw_dim()),
            b: Array2::zeros(self.b.raw_dim()),
        }
    }
}

impl DenseLayer {
    // ---
    fn new(input: usize, output: usize, rng: &mut StdRng) -> Self {
        Self {
            w: glorot(input, output, rng),
            b: Array2::zeros((1, output)),
        }
    }

    fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.w) + &self.b
    }

    fn zeros_like(&self) -> Self {
        Self {
            w: Array2::zeros(self.w.raw_dim()),
            b: Array2::zeros(self.b.raw_dim()),
        }
    }
}

impl LstmRegressor {
    // ---
    /// Build a freshly initialised network.
    ///
    /// `lstm_units` lists the width of each stacked LSTM layer, first to
    /// last; `dropout` applies to every layer's inputs and to the dense
    /// block, `recurrent_dropout` to the recurrent state.
    pub fn new(
        n_features: usize,
        lstm_units: &[usize],
        dense_units: usize,
        dropout: f64,
        recurrent_dropout: f64,
        seed: u64,
    ) -> Self {
        // ---
        let mut rng = StdRng::seed_from_u64(seed);

        let mut lstm = Vec::with_capacity(lstm_units.len());
        let mut input = n_features;
        for &units in lstm_units {
            lstm.push(LstmLayer::new(input, units, &mut rng));
            input = units;
        }

        Self {
            lstm,
            hidden: DenseLayer::new(input, dense_units, &mut rng),
            output: DenseLayer::new(dense_units, 1, &mut rng),
            dropout,
            recurrent_dropout,
        }
    }

    pub fn n_features(&self) -> usize {
        self.lstm.first().map_or(0, |l| l.w.nrows())
    }

    /// Predict one value per window of a `(windows, steps, features)` batch.
    pub fn predict(&self, windows: &Array3<f64>) -> Vec<f64> {
        // ---
        let n = windows.len_of(Axis(0));
        let mut out = Vec::with_capacity(n);

        for start in (0..n).step_by(PREDICT_CHUNK) {
            let end = (start + PREDICT_CHUNK).min(n);
            let chunk = windows.slice(s![start..end, .., ..]).to_owned();
            let (pred, _) = self.forward(&chunk, None);
            out.extend(pred.iter().copied());
        }
        out
    }

    /// Mean squared error of the network on a batch.
    pub fn evaluate(&self, windows: &Array3<f64>, targets: &[f64]) -> f64 {
        // ---
        let pred = self.predict(windows);
        if pred.is_empty() {
            return 0.0;
        }
        pred.iter().zip(targets).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / pred.len() as f64
    }

    /// Train on `(train_x, train_y)` with early stopping on
    /// `(val_x, val_y)`. The best weights seen are restored at the end.
    ///
    /// With an empty validation set the training loss drives early stopping.
    pub fn fit(
        &mut self,
        train_x: &Array3<f64>,
        train_y: &[f64],
        val_x: &Array3<f64>,
        val_y: &[f64],
        opts: &TrainOptions,
    ) -> FitSummary {
        // ---
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let mut adam = Adam::new(self, opts.learning_rate);

        let mut indices: Vec<usize> = (0..train_y.len()).collect();
        let mut best = (f64::INFINITY, 0, self.clone());
        let mut wait = 0;
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 1..=opts.epochs {
            epochs_run = epoch;
            indices.shuffle(&mut rng);

            let mut train_loss = 0.0;
            for chunk in indices.chunks(opts.batch_size.max(1)) {
                let bx = train_x.select(Axis(0), chunk);
                let by = Array2::from_shape_fn((chunk.len(), 1), |(r, _)| train_y[chunk[r]]);

                let (pred, cache) = self.forward(&bx, Some(&mut rng));
                let diff = &pred - &by;
                train_loss += diff.mapv(|v| v * v).sum();

                let d_out = diff * (2.0 / chunk.len() as f64);
                let grads = self.backward(&cache, &d_out);
                adam.step(self, &grads);
            }
            train_loss /= train_y.len().max(1) as f64;

            let val_loss = if val_y.is_empty() {
                train_loss
            } else {
                self.evaluate(val_x, val_y)
            };
            debug!(
                "Epoch {}/{} - loss: {:.6}, val_loss: {:.6}",
                epoch, opts.epochs, train_loss, val_loss
            );

            if val_loss < best.0 {
                best = (val_loss, epoch, self.clone());
                wait = 0;
            } else {
                wait += 1;
                if wait >= opts.patience {
                    info!(
                        "Early stopping at epoch {}, best epoch {} (val_loss {:.6})",
                        epoch, best.1, best.0
                    );
                    stopped_early = true;
                    break;
                }
            }
        }

        let (best_val_loss, best_epoch, best_model) = best;
        if best_epoch > 0 {
            *self = best_model;
        }

        FitSummary {
            epochs_run,
            best_epoch,
            best_val_loss,
            stopped_early,
        }
    }

    // ---

    fn forward(&self, batch: &Array3<f64>, mut rng: Option<&mut StdRng>) -> (Array2<f64>, ForwardCache) {
        // ---
        let (n, steps, _) = batch.dim();
        let mut seq: Vec<Array2<f64>> = (0..steps)
            .map(|t| batch.slice(s![.., t, ..]).to_owned())
            .collect();

        let mut layers = Vec::with_capacity(self.lstm.len());
        for layer in &self.lstm {
            let input_width = seq.first().map_or(0, |x| x.ncols());
            let input_mask = rng
                .as_deref_mut()
                .and_then(|r| dropout_mask(n, input_width, self.dropout, r));
            let recurrent_mask = rng
                .as_deref_mut()
                .and_then(|r| dropout_mask(n, layer.units(), self.recurrent_dropout, r));

            let (outputs, step_caches) = layer.forward(&seq, input_mask.as_ref(), recurrent_mask.as_ref());
            layers.push(LayerCache {
                steps: step_caches,
                input_mask,
                recurrent_mask,
            });
            seq = outputs;
        }

        let last = seq
            .pop()
            .unwrap_or_else(|| Array2::zeros((n, self.hidden.w.nrows())));
        let hidden_pre = self.hidden.forward(&last);
        let activated = hidden_pre.mapv(|v| v.max(0.0));

        let dropout_mask = rng
            .as_deref_mut()
            .and_then(|r| dropout_mask(n, activated.ncols(), self.dropout, r));
        let dropped = match &dropout_mask {
            Some(m) => &activated * m,
            None => activated,
        };

        let out = self.output.forward(&dropped);

        (
            out,
            ForwardCache {
                layers,
                last,
                hidden_pre,
                dropout_mask,
                dropped,
            },
        )
    }

    fn backward(&self, cache: &ForwardCache, d_out: &Array2<f64>) -> Self {
        // ---
        let mut grad = self.zeros_like();

        grad.output.w = cache.dropped.t().dot(d_out);
        grad.output.b = d_out.sum_axis(Axis(0)).insert_axis(Axis(0));

        let mut d_hidden = d_out.dot(&self.output.w.t());
        if let Some(m) = &cache.dropout_mask {
            d_hidden *= m;
        }
        Zip::from(&mut d_hidden)
            .and(&cache.hidden_pre)
            .for_each(|d, &pre| {
                if pre <= 0.0 {
                    *d = 0.0;
                }
            });

        grad.hidden.w = cache.last.t().dot(&d_hidden);
        grad.hidden.b = d_hidden.sum_axis(Axis(0)).insert_axis(Axis(0));
        let d_last = d_hidden.dot(&self.hidden.w.t());

        // Only the final timestep of the top layer feeds the dense block
        let steps = cache.layers.last().map_or(0, |l| l.steps.len());
        let mut d_seq: Vec<Array2<f64>> = vec![Array2::zeros(d_last.raw_dim()); steps];
        if let Some(slot) = d_seq.last_mut() {
            *slot = d_last;
        }

        for (idx, layer) in self.lstm.iter().enumerate().rev() {
            d_seq = layer.backward(&cache.layers[idx], &d_seq, &mut grad.lstm[idx]);
        }

        grad
    }

    fn zeros_like(&self) -> Self {
        Self {
            lstm: self.lstm.iter().map(LstmLayer::zeros_like).collect(),
            hidden: self.hidden.zeros_like(),
            output: self.output.zeros_like(),
            dropout: self.dropout,
            recurrent_dropout: self.recurrent_dropout,
        }
    }

    fn params(&self) -> Vec<&Array2<f64>> {
        // ---
        let mut params = Vec::with_capacity(self.lstm.len() * 3 + 4);
        for layer in &self.lstm {
            params.extend([&layer.w, &layer.u, &layer.b]);
        }
        params.extend([&self.hidden.w, &self.hidden.b, &self.output.w, &self.output.b]);
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Array2<f64>> {
        // ---
        let mut params = Vec::with_capacity(self.lstm.len() * 3 + 4);
        for layer in self.lstm.iter_mut() {
            params.extend([&mut layer.w, &mut layer.u, &mut layer.b]);
        }
        params.extend([
            &mut self.hidden.w,
            &mut self.hidden.b,
            &mut self.output.w,
            &mut self.output.b,
        ]);
        params
    }
}

/// Adam optimiser state, one moment pair per parameter matrix.
struct Adam {
    // ---
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    // ---
    fn new(model: &LstmRegressor, lr: f64) -> Self {
        // ---
        let zeros: Vec<Array2<f64>> = model.params().iter().map(|p| Array2::zeros(p.raw_dim())).collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    fn step(&mut self, model: &mut LstmRegressor, grads: &LstmRegressor) {
        // ---
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let lr_t = self.lr * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));
        let eps = self.epsilon;

        for (((param, grad), m), v) in model
            .params_mut()
            .into_iter()
            .zip(grads.params())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + eps);
                });
        }
    }
}

// ---

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

/// Derivative of the sigmoid expressed through its output.
fn sigmoid_grad(s: f64) -> f64 {
    s * (1.0 - s)
}

fn glorot(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

/// Inverted dropout mask, `None` when the rate is zero.
fn dropout_mask(rows: usize, cols: usize, rate: f64, rng: &mut StdRng) -> Option<Array2<f64>> {
    // ---
    if rate <= 0.0 {
        return None;
    }
    let keep = 1.0 / (1.0 - rate);
    Some(Array2::from_shape_fn((rows, cols), |_| {
        if rng.gen::<f64>() < rate {
            0.0
        } else {
            keep
        }
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn toy_batch(n: usize, steps: usize, seed: u64) -> (Array3<f64>, Vec<f64>) {
        // ---
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array3::from_shape_fn((n, steps, 2), |_| rng.gen_range(0.0..1.0));
        // Target: the last value of the first feature
        let y = (0..n).map(|i| x[[i, steps - 1, 0]]).collect();
        (x, y)
    }

    fn mse(model: &LstmRegressor, x: &Array3<f64>, y: &[f64]) -> f64 {
        model.evaluate(x, y)
    }

    #[test]
    fn test_shapes() {
        // ---
        let model = LstmRegressor::new(4, &[6, 5, 3], 4, 0.2, 0.2, 42);
        assert_eq!(model.n_features(), 4);

        let x = Array3::zeros((7, 10, 4));
        assert_eq!(model.predict(&x).len(), 7);
    }

    #[test]
    fn test_predict_is_deterministic() {
        // ---
        let model = LstmRegressor::new(2, &[4, 3], 3, 0.2, 0.2, 7);
        let (x, _) = toy_batch(5, 6, 1);
        assert_eq!(model.predict(&x), model.predict(&x));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        // ---
        let model = LstmRegressor::new(2, &[3, 2], 3, 0.0, 0.0, 11);
        let (x, y) = toy_batch(4, 5, 3);
        let y_col = Array2::from_shape_fn((4, 1), |(r, _)| y[r]);

        let (pred, cache) = model.forward(&x, None);
        let d_out = (&pred - &y_col) * (2.0 / 4.0);
        let grads = model.backward(&cache, &d_out);

        let eps = 1e-6;
        let n_params = model.params().len();
        for p_idx in 0..n_params {
            let shape = model.params()[p_idx].dim();
            for (r, c) in [(0, 0), (shape.0 - 1, shape.1 - 1)] {
                let mut plus = model.clone();
                plus.params_mut()[p_idx][[r, c]] += eps;
                let mut minus = model.clone();
                minus.params_mut()[p_idx][[r, c]] -= eps;

                let numeric = (mse(&plus, &x, &y) - mse(&minus, &x, &y)) / (2.0 * eps);
                let analytic = grads.params()[p_idx][[r, c]];
                let tol = 1e-5 + 1e-3 * numeric.abs().max(analytic.abs());
                assert!(
                    (numeric - analytic).abs() < tol,
                    "param {} [{}, {}]: numeric {} vs analytic {}",
                    p_idx,
                    r,
                    c,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_fit_reduces_validation_loss() {
        // ---
        let (train_x, train_y) = toy_batch(64, 6, 5);
        let (val_x, val_y) = toy_batch(16, 6, 6);
        let mut model = LstmRegressor::new(2, &[8, 4], 4, 0.0, 0.0, 42);

        let before = model.evaluate(&val_x, &val_y);
        let summary = model.fit(
            &train_x,
            &train_y,
            &val_x,
            &val_y,
            &TrainOptions {
                batch_size: 16,
                epochs: 40,
                learning_rate: 0.01,
                patience: 10,
                seed: 42,
            },
        );
        let after = model.evaluate(&val_x, &val_y);

        assert!(summary.epochs_run > 0);
        assert!(after < before, "val loss {} did not improve on {}", after, before);
        assert!((after - summary.best_val_loss).abs() < 1e-12);
    }

    #[test]
    fn test_serde_round_trip_preserves_predictions() {
        // ---
        let model = LstmRegressor::new(2, &[3], 2, 0.2, 0.2, 9);
        let json = serde_json::to_string(&model).unwrap();
        let restored: LstmRegressor = serde_json::from_str(&json).unwrap();

        let (x, _) = toy_batch(3, 4, 2);
        assert_eq!(model.predict(&x), restored.predict(&x));
    }
}
