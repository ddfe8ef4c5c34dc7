//! Additive hazard output layer.
//!
//! `H_k = softplus(z_b) + sum_{j <= k} softplus(z_j)` and `risk_k = 1 - exp(-H_k)`.
//! Every increment is non-negative, so the curve is non-decreasing by construction.

use crate::nn::{Linear, Trainable, sigmoid, softplus};
use crate::types::{RiskCurve, RiskCurveError};
use ndarray::{Array1, ArrayView1, ArrayViewD, ArrayViewMutD, array};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditiveHazardHead {
    pub hazard: Linear,
    pub base: Linear,
}

/// Forward values of the head for one input.
#[derive(Debug, Clone)]
pub struct HazardOutput {
    pub input: Array1<f64>,
    pub hazard_logits: Array1<f64>,
    pub base_logit: f64,
    pub cumulative: Array1<f64>,
}

impl HazardOutput {
    pub fn curve(&self) -> Result<RiskCurve, RiskCurveError> {
        RiskCurve::from_cumulative_hazard(&self.cumulative)
    }
}

impl AdditiveHazardHead {
    pub fn new<R: Rng + ?Sized>(inputs: usize, horizons: usize, rng: &mut R) -> Self {
        let mut hazard = Linear::new(inputs, horizons, rng);
        let mut base = Linear::new(inputs, 1, rng);
        // Start from small hazards so initial risks are low rather than near one.
        hazard.weight.mapv_inplace(|w| w * 0.1);
        hazard.bias.fill(-4.0);
        base.weight.mapv_inplace(|w| w * 0.1);
        base.bias.fill(-4.0);
        Self { hazard, base }
    }

    pub fn inputs(&self) -> usize {
        self.hazard.inputs()
    }

    pub fn horizons(&self) -> usize {
        self.hazard.outputs()
    }

    pub fn forward(&self, input: ArrayView1<f64>) -> HazardOutput {
        let hazard_logits = self.hazard.forward(input);
        let base_logit = self.base.forward(input)[0];
        let mut running = softplus(base_logit);
        let cumulative = hazard_logits.mapv(|z| {
            running += softplus(z);
            running
        });
        HazardOutput {
            input: input.to_owned(),
            hazard_logits,
            base_logit,
            cumulative,
        }
    }

    /// Backpropagates a gradient on the cumulative hazards; returns the input gradient.
    pub fn backward(&self, output: &HazardOutput, d_cumulative: &Array1<f64>, grads: &mut AdditiveHazardHead) -> Array1<f64> {
        let horizons = d_cumulative.len();
        // Increment k contributes to every H_j with j >= k.
        let mut suffix = Array1::zeros(horizons);
        let mut acc = 0.0;
        for k in (0..horizons).rev() {
            acc += d_cumulative[k];
            suffix[k] = acc;
        }
        let d_logits = &suffix * &output.hazard_logits.mapv(sigmoid);
        let d_base = array![acc * sigmoid(output.base_logit)];
        let input = output.input.view();
        let mut d_input = self.hazard.backward(input, d_logits.view(), &mut grads.hazard);
        d_input += &self.base.backward(input, d_base.view(), &mut grads.base);
        d_input
    }
}

impl Trainable for AdditiveHazardHead {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.hazard.params();
        params.extend(self.base.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.hazard.params_mut();
        params.extend(self.base.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::gradcheck::assert_gradients;
    use crate::nn::init_vector;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn curves_are_monotone_and_bounded_for_any_input() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut head = AdditiveHazardHead::new(6, 5, &mut rng);
        head.hazard.weight.mapv_inplace(|w| w * 40.0);
        for _ in 0..200 {
            let input = init_vector(6, 5.0, &mut rng);
            let out = head.forward(input.view());
            let curve = out.curve().unwrap();
            assert_eq!(curve.horizons(), 5);
            for pair in curve.values().windows(2) {
                assert!(pair[1] >= pair[0]);
            }
            assert!(curve.values().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn cumulative_is_base_plus_running_sum() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = AdditiveHazardHead::new(3, 4, &mut rng);
        let input = init_vector(3, 1.0, &mut rng);
        let out = head.forward(input.view());
        let mut expected = softplus(out.base_logit);
        for k in 0..4 {
            expected += softplus(out.hazard_logits[k]);
            assert_abs_diff_eq!(out.cumulative[k], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(6);
        let head = AdditiveHazardHead::new(4, 5, &mut rng);
        let input = init_vector(4, 1.0, &mut rng);
        let upstream = init_vector(5, 1.0, &mut rng);
        let out = head.forward(input.view());
        let mut grads = head.zeroed();
        let d_input = head.backward(&out, &upstream, &mut grads);
        assert_gradients(
            &head,
            &grads,
            |h| h.forward(input.view()).cumulative.dot(&upstream),
            1,
            1e-6,
        );

        let eps = 1e-6;
        for i in 0..4 {
            let mut plus = input.clone();
            plus[i] += eps;
            let mut minus = input.clone();
            minus[i] -= eps;
            let numeric = (head.forward(plus.view()).cumulative.dot(&upstream)
                - head.forward(minus.view()).cumulative.dot(&upstream))
                / (2.0 * eps);
            assert_abs_diff_eq!(d_input[i], numeric, epsilon = 1e-6);
        }
    }
}
