//! Per-view image encoder.
//!
//! A stack of strided 3x3 convolutions with ReLU, global max pooling over space and a
//! ReLU projection to the embedding width. Each view is encoded on its own; nothing in
//! here knows about laterality, view type or the other images of the exam.

use crate::config::ModelConfig;
use crate::nn::{Conv2d, FeatureMap, Linear, Trainable, relu_backward};
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EncoderError {
    #[error("image has shape {found:?}, the encoder expects {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("image contains non-finite pixel values")]
    NonFinitePixels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEncoder {
    pub image_height: usize,
    pub image_width: usize,
    pub pixel_mean: f64,
    pub pixel_std: f64,
    pub convs: Vec<Conv2d>,
    pub projection: Linear,
}

/// Cached activations of one forward pass.
#[derive(Debug, Clone)]
pub struct EncoderTrace {
    /// Unfolded input of each convolution.
    cols: Vec<Array2<f64>>,
    /// Pre-activation output of each convolution.
    pre: Vec<FeatureMap>,
    /// Input spatial size of each convolution.
    input_sizes: Vec<(usize, usize)>,
    argmax: Vec<usize>,
    pooled: Array1<f64>,
    projected: Array1<f64>,
}

impl ImageEncoder {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        let mut convs = Vec::with_capacity(config.encoder_channels.len());
        let mut in_channels = 1;
        for &out_channels in &config.encoder_channels {
            convs.push(Conv2d::new(in_channels, out_channels, 3, config.encoder_stride, 1, rng));
            in_channels = out_channels;
        }
        Self {
            image_height: config.image_height,
            image_width: config.image_width,
            pixel_mean: config.pixel_mean,
            pixel_std: config.pixel_std,
            convs,
            projection: Linear::new(in_channels, config.embedding_dim, rng),
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.projection.outputs()
    }

    pub fn input_shape(&self) -> (usize, usize) {
        (self.image_height, self.image_width)
    }

    fn check(&self, image: &Array2<f64>) -> Result<(), EncoderError> {
        if image.dim() != self.input_shape() {
            return Err(EncoderError::ShapeMismatch {
                expected: self.input_shape(),
                found: image.dim(),
            });
        }
        if image.iter().any(|v| !v.is_finite()) {
            return Err(EncoderError::NonFinitePixels);
        }
        Ok(())
    }

    fn normalized(&self, image: &Array2<f64>) -> FeatureMap {
        let flat = image
            .iter()
            .map(|v| (v - self.pixel_mean) / self.pixel_std)
            .collect::<Array1<f64>>();
        FeatureMap {
            data: flat.insert_axis(ndarray::Axis(0)),
            height: self.image_height,
            width: self.image_width,
        }
    }

    /// Encodes one view; a pure function of the weights and the pixels.
    pub fn encode(&self, image: &Array2<f64>) -> Result<Array1<f64>, EncoderError> {
        self.check(image)?;
        let mut map = self.normalized(image);
        for conv in &self.convs {
            let (mut out, _) = conv.forward(&map);
            out.data.mapv_inplace(crate::nn::relu);
            map = out;
        }
        let pooled = global_max_pool(&map.data).0;
        Ok(self.projection.forward(pooled.view()).mapv(crate::nn::relu))
    }

    /// Forward pass that keeps everything the backward pass needs.
    pub fn forward(&self, image: &Array2<f64>) -> Result<(Array1<f64>, EncoderTrace), EncoderError> {
        self.check(image)?;
        let mut map = self.normalized(image);
        let mut cols = Vec::with_capacity(self.convs.len());
        let mut pre = Vec::with_capacity(self.convs.len());
        let mut input_sizes = Vec::with_capacity(self.convs.len());
        for conv in &self.convs {
            input_sizes.push((map.height, map.width));
            let (out, unfolded) = conv.forward(&map);
            let mut activated = out.clone();
            activated.data.mapv_inplace(crate::nn::relu);
            cols.push(unfolded);
            pre.push(out);
            map = activated;
        }
        let (pooled, argmax) = global_max_pool(&map.data);
        let projected = self.projection.forward(pooled.view());
        let embedding = projected.mapv(crate::nn::relu);
        Ok((
            embedding,
            EncoderTrace {
                cols,
                pre,
                input_sizes,
                argmax,
                pooled,
                projected,
            },
        ))
    }

    /// Accumulates parameter gradients for an upstream gradient on the embedding.
    pub fn backward(&self, trace: &EncoderTrace, d_embedding: &Array1<f64>, grads: &mut ImageEncoder) {
        let d_projected = relu_backward(&trace.projected, d_embedding);
        let d_pooled = self
            .projection
            .backward(trace.pooled.view(), d_projected.view(), &mut grads.projection);

        let Some(last) = trace.pre.last() else {
            return;
        };
        let mut d_map = Array2::zeros(last.data.raw_dim());
        for (channel, &position) in trace.argmax.iter().enumerate() {
            d_map[[channel, position]] = d_pooled[channel];
        }

        for (index, conv) in self.convs.iter().enumerate().rev() {
            let d_pre = relu_backward(&trace.pre[index].data, &d_map);
            let (height, width) = trace.input_sizes[index];
            let d_input = conv.backward(
                &trace.cols[index],
                &d_pre,
                height,
                width,
                &mut grads.convs[index],
                index > 0,
            );
            match d_input {
                Some(d) => d_map = d,
                None => break,
            }
        }
    }
}

/// Channel-wise maximum over all spatial positions, with the winning position.
pub fn global_max_pool(data: &Array2<f64>) -> (Array1<f64>, Vec<usize>) {
    let mut pooled = Array1::zeros(data.nrows());
    let mut argmax = Vec::with_capacity(data.nrows());
    for (channel, row) in data.rows().into_iter().enumerate() {
        let (best, value) = row
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        pooled[channel] = value;
        argmax.push(best);
    }
    (pooled, argmax)
}

impl Trainable for ImageEncoder {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = Vec::new();
        for conv in &self.convs {
            params.extend(conv.params());
        }
        params.extend(self.projection.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = Vec::new();
        for conv in &mut self.convs {
            params.extend(conv.params_mut());
        }
        params.extend(self.projection.params_mut());
        params
    }
}

/// Read-only handle to a trained encoder.
///
/// Stage 2 shares one of these across worker threads. It deliberately does not
/// implement [`Trainable`], so it can never end up in an optimizer's parameter set.
#[derive(Debug, Clone)]
pub struct FrozenEncoder(Arc<ImageEncoder>);

impl FrozenEncoder {
    pub fn new(encoder: ImageEncoder) -> Self {
        Self(Arc::new(encoder))
    }

    pub fn encode(&self, image: &Array2<f64>) -> Result<Array1<f64>, EncoderError> {
        self.0.encode(image)
    }

    pub fn embedding_dim(&self) -> usize {
        self.0.embedding_dim()
    }

    pub fn input_shape(&self) -> (usize, usize) {
        self.0.input_shape()
    }

    /// Borrow of the weights, for snapshotting.
    pub fn weights(&self) -> &ImageEncoder {
        &self.0
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

    fn small_config() -> ModelConfig {
        ModelConfig {
            image_height: 12,
            image_width: 10,
            pixel_mean: 100.0,
            pixel_std: 50.0,
            encoder_channels: vec![3, 4],
            embedding_dim: 5,
            ..ModelConfig::default()
        }
    }

    fn random_image(rng: &mut StdRng) -> Array2<f64> {
        Array2::from_shape_simple_fn((12, 10), || rng.gen_range(0.0..400.0))
    }

    #[test]
    fn wrong_shape_is_an_error_not_padding() {
        let mut rng = StdRng::seed_from_u64(0);
        let encoder = ImageEncoder::new(&small_config(), &mut rng);
        let image = Array2::zeros((12, 9));
        assert_eq!(
            encoder.encode(&image),
            Err(EncoderError::ShapeMismatch {
                expected: (12, 10),
                found: (12, 9)
            })
        );
    }

    #[test]
    fn encode_and_forward_agree() {
        let mut rng = StdRng::seed_from_u64(4);
        let encoder = ImageEncoder::new(&small_config(), &mut rng);
        let image = random_image(&mut rng);
        let a = encoder.encode(&image).unwrap();
        let (b, _) = encoder.forward(&image).unwrap();
        assert_eq!(a.len(), 5);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        assert!(a.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(17);
        let encoder = ImageEncoder::new(&small_config(), &mut rng);
        let image = random_image(&mut rng);
        let upstream = init_vector(5, 1.0, &mut rng);
        let (_, trace) = encoder.forward(&image).unwrap();
        let mut grads = encoder.zeroed();
        encoder.backward(&trace, &upstream, &mut grads);
        assert_gradients(
            &encoder,
            &grads,
            |e| e.encode(&image).unwrap().dot(&upstream),
            7,
            1e-4,
        );
    }

    #[test]
    fn frozen_encoder_matches_wrapped_weights() {
        let mut rng = StdRng::seed_from_u64(2);
        let encoder = ImageEncoder::new(&small_config(), &mut rng);
        let image = random_image(&mut rng);
        let expected = encoder.encode(&image).unwrap();
        let frozen = FrozenEncoder::new(encoder);
        assert_eq!(frozen.encode(&image).unwrap(), expected);
        assert_eq!(frozen.input_shape(), (12, 10));
    }
}
