//! Minimal dense and convolutional building blocks with hand-written backward passes.
//!
//! Layers own their parameters as plain `ndarray` arrays. Gradients are stored in a
//! zeroed copy of the same layer type, so accumulation and optimizer updates walk two
//! structurally identical parameter lists side by side.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// A component whose parameters are updated by the optimizer.
///
/// `params` and `params_mut` must return the same arrays in the same order every
/// time; the optimizer keys its moment estimates by position in that list.
pub trait Trainable: Clone + Send + Sync {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>>;

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>>;

    /// A copy with every parameter set to zero, used as a gradient buffer.
    fn zeroed(&self) -> Self {
        let mut copy = self.clone();
        for mut p in copy.params_mut() {
            p.fill(0.0);
        }
        copy
    }

    fn accumulate(&mut self, other: &Self) {
        for (mut mine, theirs) in self.params_mut().into_iter().zip(other.params()) {
            mine += &theirs;
        }
    }

    fn scale(&mut self, factor: f64) {
        for mut p in self.params_mut() {
            p.mapv_inplace(|v| v * factor);
        }
    }

    fn num_params(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn squared_norm(&self) -> f64 {
        self.params()
            .iter()
            .map(|p| p.iter().map(|v| v * v).sum::<f64>())
            .sum()
    }

    fn is_finite(&self) -> bool {
        self.params().iter().all(|p| p.iter().all(|v| v.is_finite()))
    }
}

/// He-style normal initialization.
pub fn init_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, fan_in: usize, rng: &mut R) -> Array2<f64> {
    let std = (2.0 / fan_in.max(1) as f64).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || std * rng.sample::<f64, _>(StandardNormal))
}

pub fn init_vector<R: Rng + ?Sized>(len: usize, std: f64, rng: &mut R) -> Array1<f64> {
    Array1::from_shape_simple_fn(len, || std * rng.sample::<f64, _>(StandardNormal))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// Shape (out, in).
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        Self {
            weight: init_matrix(outputs, inputs, inputs, rng),
            bias: Array1::zeros(outputs),
        }
    }

    pub fn inputs(&self) -> usize {
        self.weight.ncols()
    }

    pub fn outputs(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.weight.dot(&x) + &self.bias
    }

    /// Accumulates parameter gradients into `grads` and returns the input gradient.
    pub fn backward(&self, x: ArrayView1<f64>, dy: ArrayView1<f64>, grads: &mut Linear) -> Array1<f64> {
        let outer = dy
            .insert_axis(Axis(1))
            .dot(&x.insert_axis(Axis(0)));
        grads.weight += &outer;
        grads.bias += &dy;
        self.input_gradient(dy)
    }

    /// Input gradient only, for callers that leave this layer's parameters alone.
    pub fn input_gradient(&self, dy: ArrayView1<f64>) -> Array1<f64> {
        self.weight.t().dot(&dy)
    }

    /// Row-wise forward: `x` has shape (n, in), result (n, out).
    pub fn forward_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    pub fn backward_rows(&self, x: ArrayView2<f64>, dy: ArrayView2<f64>, grads: &mut Linear) -> Array2<f64> {
        grads.weight += &dy.t().dot(&x);
        grads.bias += &dy.sum_axis(Axis(0));
        dy.dot(&self.weight)
    }
}

impl Trainable for Linear {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![self.weight.view_mut().into_dyn(), self.bias.view_mut().into_dyn()]
    }
}

/// Channels-first activation map stored as (channels, height * width).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub data: Array2<f64>,
    pub height: usize,
    pub width: usize,
}

impl FeatureMap {
    pub fn channels(&self) -> usize {
        self.data.nrows()
    }
}

/// Square-kernel 2D convolution lowered to a matrix product via im2col.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub in_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// Shape (out_channels, in_channels * kernel * kernel).
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel * kernel;
        Self {
            in_channels,
            kernel,
            stride,
            padding,
            weight: init_matrix(out_channels, fan_in, fan_in, rng),
            bias: Array1::zeros(out_channels),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let h = (height + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1;
        let w = (width + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1;
        (h, w)
    }

    /// Unfolds every receptive field into a column: (in * k * k, out_h * out_w).
    pub fn im2col(&self, input: &FeatureMap) -> Array2<f64> {
        let (out_h, out_w) = self.output_size(input.height, input.width);
        let k = self.kernel;
        let mut cols = Array2::zeros((self.in_channels * k * k, out_h * out_w));
        for c in 0..self.in_channels {
            let plane = input.data.row(c);
            for ky in 0..k {
                for kx in 0..k {
                    let row = (c * k + ky) * k + kx;
                    let mut target = cols.row_mut(row);
                    for oy in 0..out_h {
                        let iy = (oy * self.stride + ky) as isize - self.padding as isize;
                        if iy < 0 || iy as usize >= input.height {
                            continue;
                        }
                        let base = iy as usize * input.width;
                        for ox in 0..out_w {
                            let ix = (ox * self.stride + kx) as isize - self.padding as isize;
                            if ix >= 0 && (ix as usize) < input.width {
                                target[oy * out_w + ox] = plane[base + ix as usize];
                            }
                        }
                    }
                }
            }
        }
        cols
    }

    /// Folds column gradients back onto the input grid, summing overlaps.
    pub fn col2im(&self, cols: &Array2<f64>, height: usize, width: usize) -> Array2<f64> {
        let (out_h, out_w) = self.output_size(height, width);
        let k = self.kernel;
        let mut image = Array2::zeros((self.in_channels, height * width));
        for c in 0..self.in_channels {
            let mut plane = image.row_mut(c);
            for ky in 0..k {
                for kx in 0..k {
                    let source = cols.row((c * k + ky) * k + kx);
                    for oy in 0..out_h {
                        let iy = (oy * self.stride + ky) as isize - self.padding as isize;
                        if iy < 0 || iy as usize >= height {
                            continue;
                        }
                        let base = iy as usize * width;
                        for ox in 0..out_w {
                            let ix = (ox * self.stride + kx) as isize - self.padding as isize;
                            if ix >= 0 && (ix as usize) < width {
                                plane[base + ix as usize] += source[oy * out_w + ox];
                            }
                        }
                    }
                }
            }
        }
        image
    }

    /// Returns the pre-activation output and the unfolded input for the backward pass.
    pub fn forward(&self, input: &FeatureMap) -> (FeatureMap, Array2<f64>) {
        let (out_h, out_w) = self.output_size(input.height, input.width);
        let cols = self.im2col(input);
        let data = self.weight.dot(&cols) + &self.bias.view().insert_axis(Axis(1));
        (
            FeatureMap {
                data,
                height: out_h,
                width: out_w,
            },
            cols,
        )
    }

    /// Accumulates parameter gradients; returns the input gradient when `input_grad` is set.
    pub fn backward(
        &self,
        cols: &Array2<f64>,
        d_out: &Array2<f64>,
        input_height: usize,
        input_width: usize,
        grads: &mut Conv2d,
        input_grad: bool,
    ) -> Option<Array2<f64>> {
        grads.weight += &d_out.dot(&cols.t());
        grads.bias += &d_out.sum_axis(Axis(1));
        input_grad.then(|| {
            let d_cols = self.weight.t().dot(d_out);
            self.col2im(&d_cols, input_height, input_width)
        })
    }
}

impl Trainable for Conv2d {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![self.weight.view_mut().into_dyn(), self.bias.view_mut().into_dyn()]
    }
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// Passes `grad` where the pre-activation was positive.
pub fn relu_backward<D: ndarray::Dimension>(
    pre: &ndarray::Array<f64, D>,
    grad: &ndarray::Array<f64, D>,
) -> ndarray::Array<f64, D> {
    let mut out = grad.clone();
    out.zip_mut_with(pre, |g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

/// Numerically stable `ln(1 + e^x)`.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else if x < -30.0 {
        x.exp()
    } else {
        x.max(0.0) + (-x.abs()).exp().ln_1p()
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn softmax(logits: ArrayView1<f64>) -> Array1<f64> {
    let max = logits.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

pub fn softmax_rows(scores: &Array2<f64>) -> Array2<f64> {
    let mut out = scores.clone();
    for mut row in out.rows_mut() {
        let normalized = softmax(row.view());
        row.assign(&normalized);
    }
    out
}

/// Row-wise softmax Jacobian-vector product: `A * (dA - sum(dA * A))`.
pub fn softmax_rows_backward(probs: &Array2<f64>, d_probs: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(probs.raw_dim());
    for ((mut o, a), da) in out.rows_mut().into_iter().zip(probs.rows()).zip(d_probs.rows()) {
        let dot = a.dot(&da);
        o.assign(&(&a * &(&da - dot)));
    }
    out
}

#[cfg(test)]
pub(crate) mod gradcheck {
    use super::Trainable;

    /// Compares analytic gradients against central differences on every `stride`-th scalar.
    pub fn assert_gradients<T: Trainable>(model: &T, grads: &T, objective: impl Fn(&T) -> f64, stride: usize, tolerance: f64) {
        let eps = 1e-6;
        let analytic: Vec<f64> = grads.params().iter().flat_map(|p| p.iter().copied().collect::<Vec<_>>()).collect();
        assert_eq!(analytic.len(), model.num_params());
        for flat in (0..analytic.len()).step_by(stride.max(1)) {
            let plus = perturbed(model, flat, eps);
            let minus = perturbed(model, flat, -eps);
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
            let scale = 1.0f64.max(numeric.abs()).max(analytic[flat].abs());
            assert!(
                (analytic[flat] - numeric).abs() <= tolerance * scale,
                "parameter {flat}: analytic {} vs numeric {numeric}",
                analytic[flat]
            );
        }
    }

    fn perturbed<T: Trainable>(model: &T, flat: usize, delta: f64) -> T {
        let mut copy = model.clone();
        let mut remaining = flat;
        for mut p in copy.params_mut() {
            if remaining < p.len() {
                if let Some(v) = p.iter_mut().nth(remaining) {
                    *v += delta;
                }
                break;
            }
            remaining -= p.len();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn softplus_matches_naive_in_safe_range() {
        for x in [-5.0, -0.3, 0.0, 0.7, 4.0] {
            let naive = (1.0f64 + f64::exp(x)).ln();
            assert_abs_diff_eq!(softplus(x), naive, epsilon = 1e-12);
        }
        assert!(softplus(800.0).is_finite());
        assert!(softplus(-800.0) >= 0.0);
    }

    #[test]
    fn linear_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::new(4, 3, &mut rng);
        let x = init_vector(4, 1.0, &mut rng);
        let dy = init_vector(3, 1.0, &mut rng);
        let mut grads = layer.zeroed();
        let dx = layer.backward(x.view(), dy.view(), &mut grads);

        let objective = |l: &Linear, x: &Array1<f64>| l.forward(x.view()).dot(&dy);
        let eps = 1e-6;
        for i in 0..4 {
            let mut plus = x.clone();
            plus[i] += eps;
            let mut minus = x.clone();
            minus[i] -= eps;
            let numeric = (objective(&layer, &plus) - objective(&layer, &minus)) / (2.0 * eps);
            assert_abs_diff_eq!(dx[i], numeric, epsilon = 1e-6);
        }
        let mut bumped = layer.clone();
        bumped.weight[[1, 2]] += eps;
        let numeric = (objective(&bumped, &x) - objective(&layer, &x)) / eps;
        assert_abs_diff_eq!(grads.weight[[1, 2]], numeric, epsilon = 1e-4);
    }

    #[test]
    fn conv_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let conv = Conv2d::new(2, 3, 3, 2, 1, &mut rng);
        let input = FeatureMap {
            data: init_matrix(2, 5 * 6, 1, &mut rng),
            height: 5,
            width: 6,
        };
        let (out, cols) = conv.forward(&input);
        assert_eq!((out.height, out.width), (3, 3));
        let upstream = init_matrix(3, out.height * out.width, 1, &mut rng);
        let mut grads = conv.zeroed();
        let d_input = conv
            .backward(&cols, &upstream, 5, 6, &mut grads, true)
            .unwrap();

        let objective = |c: &Conv2d, x: &FeatureMap| (&c.forward(x).0.data * &upstream).sum();
        let eps = 1e-6;
        for (c, j) in [(0, 0), (1, 7), (0, 29), (1, 14)] {
            let mut plus = input.clone();
            plus.data[[c, j]] += eps;
            let mut minus = input.clone();
            minus.data[[c, j]] -= eps;
            let numeric = (objective(&conv, &plus) - objective(&conv, &minus)) / (2.0 * eps);
            assert_abs_diff_eq!(d_input[[c, j]], numeric, epsilon = 1e-6);
        }
        let mut plus = conv.clone();
        plus.weight[[2, 10]] += eps;
        let mut minus = conv.clone();
        minus.weight[[2, 10]] -= eps;
        let numeric = (objective(&plus, &input) - objective(&minus, &input)) / (2.0 * eps);
        assert_abs_diff_eq!(grads.weight[[2, 10]], numeric, epsilon = 1e-6);
    }

    #[test]
    fn softmax_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let scores = init_matrix(2, 4, 1, &mut rng);
        let upstream = init_matrix(2, 4, 1, &mut rng);
        let analytic = softmax_rows_backward(&softmax_rows(&scores), &upstream);
        let eps = 1e-6;
        for r in 0..2 {
            for c in 0..4 {
                let mut plus = scores.clone();
                plus[[r, c]] += eps;
                let mut minus = scores.clone();
                minus[[r, c]] -= eps;
                let numeric = ((&softmax_rows(&plus) * &upstream).sum()
                    - (&softmax_rows(&minus) * &upstream).sum())
                    / (2.0 * eps);
                assert_abs_diff_eq!(analytic[[r, c]], numeric, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn zeroed_and_accumulate_follow_parameter_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(2, 2, &mut rng);
        let mut total = layer.zeroed();
        assert_eq!(total.squared_norm(), 0.0);
        total.accumulate(&layer);
        total.accumulate(&layer);
        total.scale(0.5);
        assert_eq!(total, layer);
        assert_eq!(layer.num_params(), 6);
    }
}
