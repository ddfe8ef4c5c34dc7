//! Acquisition-device discriminator used only during stage 2.
//!
//! The discriminator learns to recognise the device from the fused representation;
//! the main model receives the negated, weighted gradient of the same loss so the
//! representation is pushed towards carrying no device signal.

use crate::config::AdversaryConfig;
use crate::nn::{Linear, Trainable, relu_backward, softmax};
use crate::types::DeviceLabel;
use ndarray::{Array1, ArrayView1, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Devices seen in the training split, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceVocabulary {
    pub labels: Vec<DeviceLabel>,
}

impl DeviceVocabulary {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a DeviceLabel>) -> Self {
        let mut vocabulary = Self::default();
        for label in labels {
            if vocabulary.index_of(label).is_none() {
                vocabulary.labels.push(label.clone());
            }
        }
        vocabulary
    }

    pub fn index_of(&self, label: &DeviceLabel) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDiscriminator {
    pub hidden: Linear,
    pub output: Linear,
}

/// Loss of one discriminator evaluation and the pieces needed for backward.
#[derive(Debug, Clone)]
pub struct DiscriminatorPass {
    pub loss: f64,
    input: Array1<f64>,
    hidden_pre: Array1<f64>,
    hidden: Array1<f64>,
    probabilities: Array1<f64>,
    target: usize,
}

impl DeviceDiscriminator {
    pub fn new<R: Rng + ?Sized>(inputs: usize, hidden: usize, devices: usize, rng: &mut R) -> Self {
        Self {
            hidden: Linear::new(inputs, hidden, rng),
            output: Linear::new(hidden, devices, rng),
        }
    }

    pub fn devices(&self) -> usize {
        self.output.outputs()
    }

    pub fn probabilities(&self, representation: ArrayView1<f64>) -> Array1<f64> {
        let hidden = self.hidden.forward(representation).mapv(crate::nn::relu);
        softmax(self.output.forward(hidden.view()).view())
    }

    /// Cross-entropy of the true device.
    pub fn forward(&self, representation: ArrayView1<f64>, target: usize) -> DiscriminatorPass {
        let hidden_pre = self.hidden.forward(representation);
        let hidden = hidden_pre.mapv(crate::nn::relu);
        let probabilities = softmax(self.output.forward(hidden.view()).view());
        let loss = -probabilities[target].max(f64::MIN_POSITIVE).ln();
        DiscriminatorPass {
            loss,
            input: representation.to_owned(),
            hidden_pre,
            hidden,
            probabilities,
            target,
        }
    }

    /// Accumulates discriminator gradients and returns the loss gradient with respect
    /// to the representation.
    pub fn backward(&self, pass: &DiscriminatorPass, grads: &mut DeviceDiscriminator) -> Array1<f64> {
        let mut d_logits = pass.probabilities.clone();
        d_logits[pass.target] -= 1.0;
        let d_hidden = self
            .output
            .backward(pass.hidden.view(), d_logits.view(), &mut grads.output);
        let d_hidden_pre = relu_backward(&pass.hidden_pre, &d_hidden);
        self.hidden
            .backward(pass.input.view(), d_hidden_pre.view(), &mut grads.hidden)
    }

    /// Loss gradient with respect to the representation, without touching parameter
    /// gradients. Used by the main model's update, where the discriminator is held fixed.
    pub fn representation_gradient(&self, pass: &DiscriminatorPass) -> Array1<f64> {
        let mut d_logits = pass.probabilities.clone();
        d_logits[pass.target] -= 1.0;
        let d_hidden = self.output.input_gradient(d_logits.view());
        let d_hidden_pre = relu_backward(&pass.hidden_pre, &d_hidden);
        self.hidden.input_gradient(d_hidden_pre.view())
    }
}

impl Trainable for DeviceDiscriminator {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.hidden.params();
        params.extend(self.output.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.hidden.params_mut();
        params.extend(self.output.params_mut());
        params
    }
}

/// Health of the adversarial game, judged against the chance-level loss `ln(K)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdversaryStatus {
    /// Not enough observations yet, or fewer than two devices.
    Warmup,
    Balanced,
    /// The discriminator recognises devices far better than chance.
    Dominating,
    /// The discriminator loss has blown up or is no longer finite.
    Collapsed,
}

/// Rolling window over recent discriminator losses.
#[derive(Debug, Clone)]
pub struct AdversaryMonitor {
    window: VecDeque<f64>,
    capacity: usize,
    chance_loss: f64,
    dominance_ratio: f64,
    collapse_ratio: f64,
    status: AdversaryStatus,
}

impl AdversaryMonitor {
    pub fn new(config: &AdversaryConfig, devices: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(config.monitor_window.max(1)),
            capacity: config.monitor_window.max(1),
            chance_loss: (devices.max(1) as f64).ln(),
            dominance_ratio: config.dominance_ratio,
            collapse_ratio: config.collapse_ratio,
            status: AdversaryStatus::Warmup,
        }
    }

    pub fn status(&self) -> AdversaryStatus {
        self.status
    }

    pub fn mean_loss(&self) -> Option<f64> {
        (!self.window.is_empty()).then(|| self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    /// Records one adversary loss and returns the status after it.
    pub fn observe(&mut self, loss: f64) -> AdversaryStatus {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(loss);

        let next = if !loss.is_finite() {
            AdversaryStatus::Collapsed
        } else if self.chance_loss <= 0.0 || self.window.len() < self.capacity {
            AdversaryStatus::Warmup
        } else {
            let mean = self.mean_loss().unwrap_or(self.chance_loss);
            if mean < self.dominance_ratio * self.chance_loss {
                AdversaryStatus::Dominating
            } else if mean > self.collapse_ratio * self.chance_loss {
                AdversaryStatus::Collapsed
            } else {
                AdversaryStatus::Balanced
            }
        };
        if next != self.status && matches!(next, AdversaryStatus::Dominating | AdversaryStatus::Collapsed) {
            log::warn!(
                "Device adversary is {:?}: mean loss {:.4} against chance level {:.4}.",
                next,
                self.mean_loss().unwrap_or(f64::NAN),
                self.chance_loss
            );
        }
        self.status = next;
        next
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
    fn vocabulary_keeps_first_seen_order() {
        let labels = ["a", "b", "a", "c"].map(|s| DeviceLabel(s.to_string()));
        let vocabulary = DeviceVocabulary::from_labels(labels.iter());
        assert_eq!(vocabulary.len(), 3);
        assert_eq!(vocabulary.index_of(&DeviceLabel("c".into())), Some(2));
        assert_eq!(vocabulary.index_of(&DeviceLabel("z".into())), None);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(31);
        let discriminator = DeviceDiscriminator::new(5, 7, 3, &mut rng);
        let representation = init_vector(5, 1.0, &mut rng);
        let pass = discriminator.forward(representation.view(), 1);
        let mut grads = discriminator.zeroed();
        let d_input = discriminator.backward(&pass, &mut grads);
        assert_gradients(
            &discriminator,
            &grads,
            |d| d.forward(representation.view(), 1).loss,
            1,
            1e-5,
        );
        let eps = 1e-6;
        for i in 0..5 {
            let mut plus = representation.clone();
            plus[i] += eps;
            let mut minus = representation.clone();
            minus[i] -= eps;
            let numeric = (discriminator.forward(plus.view(), 1).loss
                - discriminator.forward(minus.view(), 1).loss)
                / (2.0 * eps);
            assert_abs_diff_eq!(d_input[i], numeric, epsilon = 1e-6);
        }

        let frozen = discriminator.representation_gradient(&pass);
        for (a, b) in frozen.iter().zip(&d_input) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn monitor_flags_dominance_and_collapse() {
        let config = AdversaryConfig {
            monitor_window: 4,
            ..AdversaryConfig::default()
        };
        let chance = 3f64.ln();

        let mut monitor = AdversaryMonitor::new(&config, 3);
        for _ in 0..3 {
            assert_eq!(monitor.observe(chance), AdversaryStatus::Warmup);
        }
        assert_eq!(monitor.observe(chance), AdversaryStatus::Balanced);
        for _ in 0..4 {
            monitor.observe(0.01);
        }
        assert_eq!(monitor.status(), AdversaryStatus::Dominating);
        for _ in 0..4 {
            monitor.observe(chance * 3.0);
        }
        assert_eq!(monitor.status(), AdversaryStatus::Collapsed);
        assert_eq!(monitor.observe(f64::NAN), AdversaryStatus::Collapsed);
    }
}
