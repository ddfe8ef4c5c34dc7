//! Stage 2: aggregator, risk-factor encoder and hazard head on frozen-encoder
//! embeddings, trained against the device discriminator.
//!
//! Each batch runs the alternation schedule: `steps_per_main_step` discriminator
//! updates on representations from the current main-model parameters, then one
//! main-model update whose gradient on the representation has the weighted
//! discriminator gradient subtracted.

use crate::adversary::{AdversaryMonitor, AdversaryStatus, DeviceDiscriminator, DeviceVocabulary};
use crate::aggregator::ExamEmbeddings;
use crate::calibrate::metrics::concordance_index;
use crate::config::{ExperimentConfig, StageConfig};
use crate::data::cohort::{Cohort, load_exam};
use crate::data::dataset::ExamRecord;
use crate::encoder::FrozenEncoder;
use crate::nn::Trainable;
use crate::risk_factors::ResolvedRiskFactors;
use crate::risk_model::{ModelError, RiskModel};
use crate::train::TrainError;
use crate::train::loss::{SurvivalTarget, survival_nll};
use crate::train::observer::{EpochSummary, TrainingObserver, TrainingStage};
use crate::train::optim::{Adam, clip_gradients};
use crate::train::schedule::{AlternationSchedule, Phase};
use crate::train::sweep::Scored;
use crate::types::{OutcomeLabel, RiskCurve, Split};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

const STAGE: TrainingStage = TrainingStage::Stage2Adversarial;

/// Frozen-encoder embeddings of every exam in a cohort, indexed like the cohort.
/// Exams whose images could not be encoded have no entry.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    entries: Vec<Option<ExamEmbeddings>>,
}

impl EmbeddingCache {
    pub fn build(encoder: &FrozenEncoder, cohort: &Cohort) -> Self {
        let entries: Vec<Option<ExamEmbeddings>> = cohort
            .exams()
            .par_iter()
            .map(|record| match encode_exam(encoder, record) {
                Ok(embeddings) => Some(embeddings),
                Err(e) => {
                    log::warn!("Excluding exam {} from stage 2: {e}", record.key);
                    None
                }
            })
            .collect();
        let cache = Self { entries };
        log::info!(
            "Encoded {} of {} exams with the frozen encoder.",
            cache.available(),
            cache.entries.len()
        );
        cache
    }

    pub fn get(&self, index: usize) -> Option<&ExamEmbeddings> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub fn available(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

/// Loads the four views of an exam and encodes each one.
pub fn encode_exam(encoder: &FrozenEncoder, record: &ExamRecord) -> Result<ExamEmbeddings, TrainError> {
    let exam = load_exam(record, encoder.input_shape())?;
    let mut embeddings = ExamEmbeddings::default();
    for (slot, view) in embeddings.iter_mut().zip(exam.views()) {
        *slot = encoder.encode(&view.pixels).map_err(ModelError::from)?;
    }
    Ok(embeddings)
}

/// One stage-2 example with its embeddings resolved from the cache.
#[derive(Debug, Clone)]
pub struct ExamSample {
    pub current: ExamEmbeddings,
    pub priors: Vec<ExamEmbeddings>,
    pub factors: ResolvedRiskFactors,
    pub label: OutcomeLabel,
    pub target: SurvivalTarget,
    pub device: Option<usize>,
}

/// Samples of one split. Exams missing from the cache are skipped; so are priors.
pub fn exam_samples(
    cohort: &Cohort,
    cache: &EmbeddingCache,
    split: Split,
    config: &ExperimentConfig,
    devices: &DeviceVocabulary,
) -> Vec<ExamSample> {
    let horizons = config.model.horizons;
    let history = if config.model.use_history {
        config.model.max_prior_exams
    } else {
        0
    };
    cohort
        .split(split)
        .into_iter()
        .filter_map(|index| {
            let current = cache.get(index)?.clone();
            let record = cohort.exam(index);
            let priors = cohort
                .priors_of(index, history)
                .into_iter()
                .filter_map(|p| cache.get(p).cloned())
                .collect();
            Some(ExamSample {
                current,
                priors,
                factors: record.resolved.clone(),
                label: record.label,
                target: SurvivalTarget::from_label(&record.label, horizons),
                device: record.device.as_ref().and_then(|d| devices.index_of(d)),
            })
        })
        .collect()
}

/// Risk curves of a stage-2 model on prepared samples.
pub fn model_curves(model: &RiskModel, samples: &[ExamSample]) -> Result<Vec<RiskCurve>, TrainError> {
    samples
        .par_iter()
        .map(|sample| -> Result<RiskCurve, TrainError> {
            let trace = model.forward(&sample.current, &sample.priors, &sample.factors)?;
            Ok(trace.hazard.curve()?)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Stage2Outcome {
    pub model: RiskModel,
    pub adversary: Option<DeviceDiscriminator>,
    pub devices: DeviceVocabulary,
    pub dev_c_index: Option<f64>,
    pub adversary_status: AdversaryStatus,
    pub epochs: usize,
    pub steps: usize,
}

impl Scored for Stage2Outcome {
    fn dev_c_index(&self) -> Option<f64> {
        self.dev_c_index
    }
}

struct Adversary {
    discriminator: DeviceDiscriminator,
    optimizer: Adam,
    monitor: AdversaryMonitor,
    weight: f64,
}

impl Adversary {
    /// One discriminator update on representations of the current main model.
    fn update(&mut self, representations: &[(Array1<f64>, usize)]) -> f64 {
        if representations.is_empty() {
            return 0.0;
        }
        let zero = self.discriminator.zeroed();
        let discriminator = &self.discriminator;
        let (loss, mut grads) = representations
            .par_iter()
            .fold(
                || (0.0, zero.clone()),
                |(loss, mut grads), (repr, device)| {
                    let pass = discriminator.forward(repr.view(), *device);
                    discriminator.backward(&pass, &mut grads);
                    (loss + pass.loss, grads)
                },
            )
            .reduce(
                || (0.0, zero.clone()),
                |(la, mut ga), (lb, gb)| {
                    ga.accumulate(&gb);
                    (la + lb, ga)
                },
            );
        let n = representations.len() as f64;
        grads.scale(1.0 / n);
        self.optimizer.step(&mut self.discriminator, &grads);
        let mean = loss / n;
        self.monitor.observe(mean);
        mean
    }
}

/// Trains one stage-2 candidate from cached embeddings.
pub fn train_stage2(
    cohort: &Cohort,
    cache: &EmbeddingCache,
    config: &ExperimentConfig,
    stage: &StageConfig,
    candidate: usize,
    seed: u64,
    observer: &dyn TrainingObserver,
) -> Result<Stage2Outcome, TrainError> {
    let train_indices = cohort.split(Split::Train);
    let devices =
        DeviceVocabulary::from_labels(train_indices.iter().filter_map(|&i| cohort.exam(i).device.as_ref()));
    let mut train: Vec<ExamSample> = exam_samples(cohort, cache, Split::Train, config, &devices)
        .into_iter()
        .filter(|s| s.target.is_informative())
        .collect();
    if train.is_empty() {
        return Err(TrainError::NoExams {
            stage: STAGE,
            split: "train",
        });
    }
    let dev = exam_samples(cohort, cache, Split::Dev, config, &devices);
    if dev.is_empty() {
        return Err(TrainError::NoExams {
            stage: STAGE,
            split: "dev",
        });
    }
    let dev_labels: Vec<OutcomeLabel> = dev.iter().map(|s| s.label).collect();
    let horizons = config.model.horizons;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = RiskModel::new(&config.model, &config.risk_factors, &mut rng);
    let mut optimizer = Adam::new(stage.learning_rate, stage.weight_decay);

    let adversary_config = &config.adversary;
    let mut adversary = if adversary_config.enabled && devices.len() >= 2 {
        Some(Adversary {
            discriminator: DeviceDiscriminator::new(
                model.representation_dim(),
                adversary_config.hidden_dim,
                devices.len(),
                &mut rng,
            ),
            optimizer: Adam::new(adversary_config.learning_rate, 0.0),
            monitor: AdversaryMonitor::new(adversary_config, devices.len()),
            weight: adversary_config.loss_weight,
        })
    } else {
        if adversary_config.enabled {
            log::warn!(
                "{STAGE}: only {} device(s) in the train split; the device adversary is disabled.",
                devices.len()
            );
        }
        None
    };
    let mut schedule = AlternationSchedule::new(adversary_config.steps_per_main_step, adversary.is_some());
    log::info!(
        "{STAGE}: candidate {candidate} trains {} parameters on {} exams, {} device(s).",
        model.num_params(),
        train.len(),
        devices.len()
    );

    let mut best: Option<(RiskModel, Option<DeviceDiscriminator>, Option<f64>)> = None;
    let mut stale = 0usize;
    let mut steps = 0usize;
    let mut epochs = 0usize;
    let batch_size = stage.batch_size.max(1);

    for epoch in 1..=stage.epochs {
        epochs = epoch;
        train.shuffle(&mut rng);
        let mut epoch_loss = 0.0;
        let mut epoch_samples = 0usize;
        let mut budget_exhausted = false;

        for batch in train.chunks(batch_size) {
            let mut representations: Option<Vec<(Array1<f64>, usize)>> = None;
            loop {
                match schedule.advance() {
                    Phase::Adversary => {
                        let Some(adversary) = adversary.as_mut() else {
                            continue;
                        };
                        if representations.is_none() {
                            representations = Some(device_representations(&model, batch)?);
                        }
                        let reprs = representations.as_deref().unwrap_or(&[]);
                        let loss = adversary.update(reprs);
                        log::debug!("{STAGE}: candidate {candidate} adversary loss {loss:.5}");
                    }
                    Phase::Main => {
                        let loss = main_update(
                            &mut model,
                            &mut optimizer,
                            adversary.as_ref(),
                            batch,
                            stage.gradient_clip,
                        )?;
                        if !loss.is_finite() {
                            return Err(TrainError::Diverged {
                                stage: STAGE,
                                epoch,
                                step: steps,
                            });
                        }
                        epoch_loss += loss * batch.len() as f64;
                        epoch_samples += batch.len();
                        steps += 1;
                        log::debug!("{STAGE}: candidate {candidate} epoch {epoch} step {steps}: loss {loss:.5}");
                        break;
                    }
                }
            }
            if stage.max_steps > 0 && steps >= stage.max_steps {
                budget_exhausted = true;
                break;
            }
        }

        let curves = model_curves(&model, &dev)?;
        let c_index = concordance_index(&curves, &dev_labels, horizons);
        let train_loss = epoch_loss / epoch_samples.max(1) as f64;
        let status = adversary.as_ref().map(|a| a.monitor.status());
        observer.on_epoch_end(&EpochSummary {
            stage: STAGE,
            candidate,
            epoch,
            steps,
            samples: epoch_samples,
            train_loss,
            dev_c_index: c_index,
            adversary: status,
        });
        log::info!(
            "{STAGE}: candidate {candidate} epoch {epoch}: loss {train_loss:.5}, dev C-index {c_index:?}, adversary {status:?}"
        );

        let improved = match (c_index, best.as_ref().map(|(_, _, c)| *c)) {
            (_, None) => true,
            (Some(c), Some(Some(b))) => c > b,
            (Some(_), Some(None)) => true,
            (None, Some(_)) => false,
        };
        if improved {
            best = Some((
                model.clone(),
                adversary.as_ref().map(|a| a.discriminator.clone()),
                c_index,
            ));
            stale = 0;
        } else {
            stale += 1;
        }

        if budget_exhausted {
            log::info!("{STAGE}: candidate {candidate} exhausted its step budget of {}.", stage.max_steps);
            break;
        }
        if stage.patience > 0 && stale >= stage.patience {
            log::info!("{STAGE}: candidate {candidate} converged after {stale} epochs without improvement.");
            break;
        }
    }

    log::debug!(
        "{STAGE}: candidate {candidate} ran {} adversary and {} main updates.",
        schedule.adversary_updates(),
        schedule.main_updates()
    );
    let adversary_status = adversary
        .as_ref()
        .map(|a| a.monitor.status())
        .unwrap_or(AdversaryStatus::Warmup);
    let (model, discriminator, dev_c_index) =
        best.unwrap_or_else(|| (model, adversary.map(|a| a.discriminator), None));
    observer.on_candidate_finish(STAGE, candidate, dev_c_index);
    Ok(Stage2Outcome {
        model,
        adversary: discriminator,
        devices,
        dev_c_index,
        adversary_status,
        epochs,
        steps,
    })
}

/// Fused representations of the batch exams that carry a known device.
fn device_representations(model: &RiskModel, batch: &[ExamSample]) -> Result<Vec<(Array1<f64>, usize)>, TrainError> {
    batch
        .par_iter()
        .filter_map(|sample| sample.device.map(|device| (sample, device)))
        .map(|(sample, device)| -> Result<(Array1<f64>, usize), TrainError> {
            let trace = model.forward(&sample.current, &sample.priors, &sample.factors)?;
            Ok((trace.fused, device))
        })
        .collect()
}

/// One main-model update. Returns the mean survival loss of the batch.
fn main_update(
    model: &mut RiskModel,
    optimizer: &mut Adam,
    adversary: Option<&Adversary>,
    batch: &[ExamSample],
    gradient_clip: f64,
) -> Result<f64, TrainError> {
    let zero = model.zeroed();
    let current: &RiskModel = model;
    let (loss, mut grads) = batch
        .par_iter()
        .try_fold(
            || (0.0, zero.clone()),
            |(loss, mut grads), sample| -> Result<_, TrainError> {
                let trace = current.forward(&sample.current, &sample.priors, &sample.factors)?;
                let (sample_loss, d_cumulative) = survival_nll(&trace.hazard.cumulative, sample.target);
                let adversarial = adversary.zip(sample.device).map(|(adversary, device)| {
                    let pass = adversary.discriminator.forward(trace.fused.view(), device);
                    adversary.discriminator.representation_gradient(&pass) * -adversary.weight
                });
                current.backward(&trace, &d_cumulative, adversarial.as_ref(), &mut grads);
                Ok((loss + sample_loss, grads))
            },
        )
        .try_reduce(
            || (0.0, zero.clone()),
            |(la, mut ga), (lb, gb)| {
                ga.accumulate(&gb);
                Ok((la + lb, ga))
            },
        )?;

    let n = batch.len() as f64;
    grads.scale(1.0 / n);
    if !grads.is_finite() {
        return Ok(f64::NAN);
    }
    clip_gradients(&mut grads, gradient_clip);
    optimizer.step(model, &grads);
    Ok(loss / n)
}
