//! Trainable parameter sets of the two training stages.
//!
//! [`ViewRiskModel`] is the stage-1 model: one image in, one risk curve out.
//! [`RiskModel`] is the stage-2 model: it never sees pixels, only the embeddings
//! produced by a [`FrozenEncoder`](crate::encoder::FrozenEncoder).

use crate::aggregator::{AggregatorError, AggregatorTrace, ExamEmbeddings, ImageAggregator};
use crate::config::ModelConfig;
use crate::encoder::{EncoderError, EncoderTrace, ImageEncoder};
use crate::hazard::{AdditiveHazardHead, HazardOutput};
use crate::nn::Trainable;
use crate::risk_factors::{ResolvedRiskFactors, RiskFactorEncoder, RiskFactorError, RiskFactorSchema, RiskFactorTrace};
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, s};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error(transparent)]
    RiskFactors(#[from] RiskFactorError),
}

fn join(a: &Array1<f64>, b: &Array1<f64>) -> Array1<f64> {
    a.iter().chain(b.iter()).copied().collect()
}

/// Stage-1 model: encoder, risk-factor encoder and hazard head applied to a single view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRiskModel {
    pub encoder: ImageEncoder,
    pub risk_factors: RiskFactorEncoder,
    pub hazard: AdditiveHazardHead,
}

#[derive(Debug, Clone)]
pub struct ViewTrace {
    encoder: EncoderTrace,
    risk_factors: RiskFactorTrace,
    pub hazard: HazardOutput,
    embedding_dim: usize,
}

impl ViewRiskModel {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, schema: &RiskFactorSchema, rng: &mut R) -> Self {
        let encoder = ImageEncoder::new(config, rng);
        Self::with_encoder(encoder, config, schema, rng)
    }

    /// Builds the stage-1 model around an existing (for example pretrained) encoder.
    pub fn with_encoder<R: Rng + ?Sized>(
        encoder: ImageEncoder,
        config: &ModelConfig,
        schema: &RiskFactorSchema,
        rng: &mut R,
    ) -> Self {
        let risk_factors = RiskFactorEncoder::new(schema, config.field_dim, config.risk_factor_dim, rng);
        let hazard = AdditiveHazardHead::new(
            encoder.embedding_dim() + risk_factors.output_dim(),
            config.horizons,
            rng,
        );
        Self {
            encoder,
            risk_factors,
            hazard,
        }
    }

    pub fn forward(&self, image: &Array2<f64>, factors: &ResolvedRiskFactors) -> Result<ViewTrace, ModelError> {
        let (embedding, encoder) = self.encoder.forward(image)?;
        let (factor_embedding, risk_factors) = self.risk_factors.forward(factors)?;
        let hazard = self.hazard.forward(join(&embedding, &factor_embedding).view());
        Ok(ViewTrace {
            encoder,
            risk_factors,
            hazard,
            embedding_dim: embedding.len(),
        })
    }

    pub fn backward(&self, trace: &ViewTrace, d_cumulative: &Array1<f64>, grads: &mut ViewRiskModel) {
        let d_input = self.hazard.backward(&trace.hazard, d_cumulative, &mut grads.hazard);
        let d_embedding = d_input.slice(s![..trace.embedding_dim]).to_owned();
        let d_factors = d_input.slice(s![trace.embedding_dim..]);
        self.encoder.backward(&trace.encoder, &d_embedding, &mut grads.encoder);
        self.risk_factors
            .backward(&trace.risk_factors, d_factors, &mut grads.risk_factors);
    }
}

impl Trainable for ViewRiskModel {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.encoder.params();
        params.extend(self.risk_factors.params());
        params.extend(self.hazard.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.encoder.params_mut();
        params.extend(self.risk_factors.params_mut());
        params.extend(self.hazard.params_mut());
        params
    }
}

/// Stage-2 model over precomputed view embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
    pub aggregator: ImageAggregator,
    pub risk_factors: RiskFactorEncoder,
    pub hazard: AdditiveHazardHead,
}

#[derive(Debug, Clone)]
pub struct ExamTrace {
    aggregator: AggregatorTrace,
    risk_factors: RiskFactorTrace,
    /// Output of the aggregator, the representation the adversary sees.
    pub fused: Array1<f64>,
    pub hazard: HazardOutput,
}

impl RiskModel {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, schema: &RiskFactorSchema, rng: &mut R) -> Self {
        let aggregator = ImageAggregator::new(
            config.embedding_dim,
            config.aggregator_dim,
            config.aggregator_dim,
            config.max_prior_exams,
            config.use_history,
            rng,
        );
        let risk_factors = RiskFactorEncoder::new(schema, config.field_dim, config.risk_factor_dim, rng);
        let hazard = AdditiveHazardHead::new(
            aggregator.output_dim() + risk_factors.output_dim(),
            config.horizons,
            rng,
        );
        Self {
            aggregator,
            risk_factors,
            hazard,
        }
    }

    pub fn representation_dim(&self) -> usize {
        self.aggregator.output_dim()
    }

    pub fn forward(
        &self,
        current: &ExamEmbeddings,
        priors: &[ExamEmbeddings],
        factors: &ResolvedRiskFactors,
    ) -> Result<ExamTrace, ModelError> {
        let (fused, aggregator) = self.aggregator.forward(current, priors)?;
        let (factor_embedding, risk_factors) = self.risk_factors.forward(factors)?;
        let hazard = self.hazard.forward(join(&fused, &factor_embedding).view());
        Ok(ExamTrace {
            aggregator,
            risk_factors,
            fused,
            hazard,
        })
    }

    /// Backpropagates the survival gradient plus an optional extra gradient on the
    /// fused representation (the adversarial term).
    pub fn backward(
        &self,
        trace: &ExamTrace,
        d_cumulative: &Array1<f64>,
        d_fused_extra: Option<&Array1<f64>>,
        grads: &mut RiskModel,
    ) {
        let d_input = self.hazard.backward(&trace.hazard, d_cumulative, &mut grads.hazard);
        let fused_dim = trace.fused.len();
        let mut d_fused = d_input.slice(s![..fused_dim]).to_owned();
        if let Some(extra) = d_fused_extra {
            d_fused += extra;
        }
        self.aggregator.backward(&trace.aggregator, &d_fused, &mut grads.aggregator);
        self.risk_factors
            .backward(&trace.risk_factors, d_input.slice(s![fused_dim..]), &mut grads.risk_factors);
    }
}

impl Trainable for RiskModel {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.aggregator.params();
        params.extend(self.risk_factors.params());
        params.extend(self.hazard.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.aggregator.params_mut();
        params.extend(self.risk_factors.params_mut());
        params.extend(self.hazard.params_mut());
        params
    }
}
