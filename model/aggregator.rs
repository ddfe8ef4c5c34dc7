//! Fuses the per-view embeddings of an exam (and optionally of prior exams) into a
//! single representation.
//!
//! Every image becomes a token: projected embedding plus learned laterality, view-type
//! and time-point embeddings. The tokens go through one single-head self-attention
//! layer with a residual connection, are mean-pooled and projected with ReLU.

use crate::nn::{Linear, Trainable, init_matrix, init_vector, relu_backward, softmax_rows, softmax_rows_backward};
use crate::types::ViewSlot;
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AggregatorError {
    #[error("current exam must contribute exactly 4 view embeddings, got {0}")]
    IncompleteExam(usize),
    #[error("embedding has width {found}, the aggregator expects {expected}")]
    EmbeddingWidth { expected: usize, found: usize },
}

/// Embeddings of the four views of one exam, in canonical slot order.
pub type ExamEmbeddings = [Array1<f64>; 4];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAggregator {
    pub input: Linear,
    /// One row per laterality.
    pub side: Array2<f64>,
    /// One row per view type.
    pub view: Array2<f64>,
    /// Row 0 is the current exam, row j the j-th most recent prior.
    pub time: Array2<f64>,
    pub no_history: Array1<f64>,
    pub query: Array2<f64>,
    pub key: Array2<f64>,
    pub value: Array2<f64>,
    pub output: Array2<f64>,
    pub projection: Linear,
    pub use_history: bool,
}

/// Where a token came from, needed to route gradients back.
#[derive(Debug, Clone, Copy)]
enum TokenSource {
    Image {
        slot: ViewSlot,
        time: usize,
        row: usize,
    },
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct AggregatorTrace {
    sources: Vec<TokenSource>,
    images: Array2<f64>,
    tokens: Array2<f64>,
    q: Array2<f64>,
    k: Array2<f64>,
    v: Array2<f64>,
    attention: Array2<f64>,
    context: Array2<f64>,
    pooled: Array1<f64>,
    projected: Array1<f64>,
}

impl ImageAggregator {
    pub fn new<R: Rng + ?Sized>(
        embedding_dim: usize,
        model_dim: usize,
        output_dim: usize,
        max_prior_exams: usize,
        use_history: bool,
        rng: &mut R,
    ) -> Self {
        let tag_std = 0.1;
        Self {
            input: Linear::new(embedding_dim, model_dim, rng),
            side: init_matrix(2, model_dim, 1, rng) * tag_std,
            view: init_matrix(2, model_dim, 1, rng) * tag_std,
            time: init_matrix(max_prior_exams + 1, model_dim, 1, rng) * tag_std,
            no_history: init_vector(model_dim, tag_std, rng),
            query: init_matrix(model_dim, model_dim, model_dim, rng),
            key: init_matrix(model_dim, model_dim, model_dim, rng),
            value: init_matrix(model_dim, model_dim, model_dim, rng),
            output: init_matrix(model_dim, model_dim, model_dim, rng) * 0.5,
            projection: Linear::new(model_dim, output_dim, rng),
            use_history,
        }
    }

    pub fn model_dim(&self) -> usize {
        self.input.outputs()
    }

    pub fn output_dim(&self) -> usize {
        self.projection.outputs()
    }

    pub fn max_prior_exams(&self) -> usize {
        self.time.nrows() - 1
    }

    /// Fuses one exam. Priors are ordered most recent first; extra priors are ignored.
    pub fn aggregate(&self, current: &[Array1<f64>], priors: &[ExamEmbeddings]) -> Result<Array1<f64>, AggregatorError> {
        Ok(self.forward(current, priors)?.0)
    }

    pub fn forward(
        &self,
        current: &[Array1<f64>],
        priors: &[ExamEmbeddings],
    ) -> Result<(Array1<f64>, AggregatorTrace), AggregatorError> {
        if current.len() != 4 {
            return Err(AggregatorError::IncompleteExam(current.len()));
        }
        let embedding_dim = self.input.inputs();
        let used_priors = if self.use_history {
            &priors[..priors.len().min(self.max_prior_exams())]
        } else {
            &[][..]
        };

        let mut sources = Vec::new();
        let mut rows: Vec<&Array1<f64>> = Vec::new();
        let exams = std::iter::once(current).chain(used_priors.iter().map(|p| &p[..]));
        for (time, views) in exams.enumerate() {
            for (slot, embedding) in ViewSlot::ALL.iter().zip(views) {
                if embedding.len() != embedding_dim {
                    return Err(AggregatorError::EmbeddingWidth {
                        expected: embedding_dim,
                        found: embedding.len(),
                    });
                }
                sources.push(TokenSource::Image {
                    slot: *slot,
                    time,
                    row: rows.len(),
                });
                rows.push(embedding);
            }
        }
        if self.use_history && used_priors.is_empty() {
            sources.push(TokenSource::Placeholder);
        }

        let mut images = Array2::zeros((rows.len(), embedding_dim));
        for (i, row) in rows.iter().enumerate() {
            images.row_mut(i).assign(*row);
        }
        let projected_images = self.input.forward_rows(images.view());

        let d = self.model_dim();
        let mut tokens = Array2::zeros((sources.len(), d));
        for (i, source) in sources.iter().enumerate() {
            let mut token = tokens.row_mut(i);
            match *source {
                TokenSource::Image { slot, time, row } => {
                    token.assign(&projected_images.row(row));
                    token += &self.side.row(slot.laterality.index());
                    token += &self.view.row(slot.kind.index());
                    token += &self.time.row(time);
                }
                TokenSource::Placeholder => token.assign(&self.no_history),
            }
        }

        let scale = (d as f64).sqrt();
        let q = tokens.dot(&self.query);
        let k = tokens.dot(&self.key);
        let v = tokens.dot(&self.value);
        let attention = softmax_rows(&(q.dot(&k.t()) / scale));
        let context = attention.dot(&v);
        let mixed = &tokens + &context.dot(&self.output);
        let pooled = mixed.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
        let projected = self.projection.forward(pooled.view());
        let fused = projected.mapv(crate::nn::relu);

        Ok((
            fused,
            AggregatorTrace {
                sources,
                images,
                tokens,
                q,
                k,
                v,
                attention,
                context,
                pooled,
                projected,
            },
        ))
    }

    /// Accumulates gradients for an upstream gradient on the fused representation.
    pub fn backward(&self, trace: &AggregatorTrace, d_fused: &Array1<f64>, grads: &mut ImageAggregator) {
        let d = self.model_dim();
        let n = trace.tokens.nrows();
        let scale = (d as f64).sqrt();

        let d_projected = relu_backward(&trace.projected, d_fused);
        let d_pooled = self
            .projection
            .backward(trace.pooled.view(), d_projected.view(), &mut grads.projection);

        // Mean pooling spreads the gradient evenly over the rows.
        let d_mixed = Array2::from_shape_fn((n, d), |(_, j)| d_pooled[j] / n as f64);

        // Residual branch plus the attention branch.
        let mut d_tokens = d_mixed.clone();
        grads.output += &trace.context.t().dot(&d_mixed);
        let d_context = d_mixed.dot(&self.output.t());
        let d_attention = d_context.dot(&trace.v.t());
        let d_v = trace.attention.t().dot(&d_context);
        let d_scores = softmax_rows_backward(&trace.attention, &d_attention) / scale;
        let d_q = d_scores.dot(&trace.k);
        let d_k = d_scores.t().dot(&trace.q);

        grads.query += &trace.tokens.t().dot(&d_q);
        grads.key += &trace.tokens.t().dot(&d_k);
        grads.value += &trace.tokens.t().dot(&d_v);
        d_tokens += &d_q.dot(&self.query.t());
        d_tokens += &d_k.dot(&self.key.t());
        d_tokens += &d_v.dot(&self.value.t());

        let mut d_projected_images = Array2::zeros((trace.images.nrows(), d));
        for (i, source) in trace.sources.iter().enumerate() {
            let grad = d_tokens.row(i);
            match *source {
                TokenSource::Image { slot, time, row } => {
                    d_projected_images.row_mut(row).assign(&grad);
                    let mut side = grads.side.row_mut(slot.laterality.index());
                    side += &grad;
                    let mut view = grads.view.row_mut(slot.kind.index());
                    view += &grad;
                    let mut when = grads.time.row_mut(time);
                    when += &grad;
                }
                TokenSource::Placeholder => grads.no_history += &grad,
            }
        }
        self.input
            .backward_rows(trace.images.view(), d_projected_images.view(), &mut grads.input);
    }
}

impl Trainable for ImageAggregator {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.input.params();
        params.extend([
            self.side.view().into_dyn(),
            self.view.view().into_dyn(),
            self.time.view().into_dyn(),
            self.no_history.view().into_dyn(),
            self.query.view().into_dyn(),
            self.key.view().into_dyn(),
            self.value.view().into_dyn(),
            self.output.view().into_dyn(),
        ]);
        params.extend(self.projection.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.input.params_mut();
        params.extend([
            self.side.view_mut().into_dyn(),
            self.view.view_mut().into_dyn(),
            self.time.view_mut().into_dyn(),
            self.no_history.view_mut().into_dyn(),
            self.query.view_mut().into_dyn(),
            self.key.view_mut().into_dyn(),
            self.value.view_mut().into_dyn(),
            self.output.view_mut().into_dyn(),
        ]);
        params.extend(self.projection.params_mut());
        params
    }
}
