//! Adam with decoupled weight decay, and global-norm gradient clipping.

use crate::nn::Trainable;
use ndarray::{ArrayD, Zip};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-8;

/// Moment estimates are keyed by position in [`Trainable::params`], so one optimizer
/// must only ever step one model.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    weight_decay: f64,
    steps: u64,
    first: Vec<ArrayD<f64>>,
    second: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            weight_decay: weight_decay.max(0.0),
            steps: 0,
            first: Vec::new(),
            second: Vec::new(),
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn step<T: Trainable>(&mut self, model: &mut T, grads: &T) {
        let gradients = grads.params();
        if self.first.len() != gradients.len() {
            self.first = gradients.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.second = self.first.clone();
        }
        self.steps += 1;
        let t = self.steps as f64;
        let first_correction = 1.0 - BETA1.powf(t);
        let second_correction = 1.0 - BETA2.powf(t);
        let lr = self.learning_rate;
        let decay = lr * self.weight_decay;

        for (((param, grad), m), v) in model
            .params_mut()
            .into_iter()
            .zip(gradients)
            .zip(self.first.iter_mut())
            .zip(self.second.iter_mut())
        {
            Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
                *m = BETA1 * *m + (1.0 - BETA1) * g;
                *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                let m_hat = *m / first_correction;
                let v_hat = *v / second_correction;
                *p -= decay * *p + lr * m_hat / (v_hat.sqrt() + EPSILON);
            });
        }
    }
}

/// Rescales `grads` so their global L2 norm is at most `max_norm`. Returns the norm
/// before clipping. A non-positive `max_norm` disables clipping.
pub fn clip_gradients<T: Trainable>(grads: &mut T, max_norm: f64) -> f64 {
    let norm = grads.squared_norm().sqrt();
    if max_norm > 0.0 && norm > max_norm {
        grads.scale(max_norm / norm);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn adam_minimizes_a_quadratic() {
        let mut model = Linear {
            weight: array![[3.0, -2.0]],
            bias: array![1.5],
        };
        let mut adam = Adam::new(0.05, 0.0);
        for _ in 0..2000 {
            // Gradient of 0.5 * ||params||^2.
            let grads = model.clone();
            adam.step(&mut model, &grads);
        }
        assert_eq!(adam.steps(), 2000);
        assert!(model.squared_norm() < 1e-3);
    }

    #[test]
    fn first_adam_step_moves_by_the_learning_rate() {
        let mut model = Linear {
            weight: array![[1.0]],
            bias: array![-1.0],
        };
        let grads = Linear {
            weight: array![[0.3]],
            bias: array![-7.0],
        };
        Adam::new(0.01, 0.0).step(&mut model, &grads);
        assert_abs_diff_eq!(model.weight[[0, 0]], 0.99, epsilon = 1e-6);
        assert_abs_diff_eq!(model.bias[0], -0.99, epsilon = 1e-6);
    }

    #[test]
    fn weight_decay_shrinks_parameters_without_gradient() {
        let mut model = Linear {
            weight: array![[2.0]],
            bias: array![0.0],
        };
        let grads = model.zeroed();
        Adam::new(0.1, 0.5).step(&mut model, &grads);
        assert_abs_diff_eq!(model.weight[[0, 0]], 2.0 - 0.1 * 0.5 * 2.0, epsilon = 1e-12);
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let mut grads = Linear {
            weight: array![[3.0, 0.0]],
            bias: array![4.0],
        };
        let before = clip_gradients(&mut grads, 1.0);
        assert_abs_diff_eq!(before, 5.0);
        assert_abs_diff_eq!(grads.squared_norm().sqrt(), 1.0, epsilon = 1e-12);
        let mut small = Linear {
            weight: array![[0.1, 0.0]],
            bias: array![0.0],
        };
        clip_gradients(&mut small, 1.0);
        assert_abs_diff_eq!(small.weight[[0, 0]], 0.1);
    }
}
