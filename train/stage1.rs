//! Stage 1: per-view training of the image encoder, risk-factor encoder and hazard head.

use crate::calibrate::metrics::concordance_index;
use crate::config::{ExperimentConfig, StageConfig};
use crate::data::DataError;
use crate::data::cohort::Cohort;
use crate::data::image::load_png16;
use crate::encoder::ImageEncoder;
use crate::nn::Trainable;
use crate::risk_model::ViewRiskModel;
use crate::train::TrainError;
use crate::train::augment::Augmenter;
use crate::train::loss::{SurvivalTarget, survival_nll};
use crate::train::observer::{EpochSummary, TrainingObserver, TrainingStage};
use crate::train::optim::{Adam, clip_gradients};
use crate::train::sweep::Scored;
use crate::types::{OutcomeLabel, RiskCurve, Split};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;

const STAGE: TrainingStage = TrainingStage::Stage1Pretrain;

/// The best per-view model of one candidate run.
#[derive(Debug, Clone)]
pub struct Stage1Outcome {
    pub model: ViewRiskModel,
    pub dev_c_index: Option<f64>,
    pub epochs: usize,
    pub steps: usize,
}

impl Scored for Stage1Outcome {
    fn dev_c_index(&self) -> Option<f64> {
        self.dev_c_index
    }
}

/// One training image: an exam index and a view position.
#[derive(Debug, Clone, Copy)]
struct ViewSample {
    exam: usize,
    view: usize,
    target: SurvivalTarget,
}

/// Trains one stage-1 candidate. `initial` replaces the random encoder initialization.
pub fn train_stage1(
    cohort: &Cohort,
    config: &ExperimentConfig,
    stage: &StageConfig,
    initial: Option<&ImageEncoder>,
    candidate: usize,
    seed: u64,
    observer: &dyn TrainingObserver,
) -> Result<Stage1Outcome, TrainError> {
    let horizons = config.model.horizons;
    let shape = (config.model.image_height, config.model.image_width);

    let mut samples: Vec<ViewSample> = cohort
        .split(Split::Train)
        .into_iter()
        .filter_map(|exam| {
            let target = SurvivalTarget::from_label(&cohort.exam(exam).label, horizons);
            target.is_informative().then_some((exam, target))
        })
        .flat_map(|(exam, target)| (0..4).map(move |view| ViewSample { exam, view, target }))
        .collect();
    if samples.is_empty() {
        return Err(TrainError::NoExams {
            stage: STAGE,
            split: "train",
        });
    }
    let dev = cohort.split(Split::Dev);
    if dev.is_empty() {
        return Err(TrainError::NoExams {
            stage: STAGE,
            split: "dev",
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = match initial {
        Some(encoder) => ViewRiskModel::with_encoder(encoder.clone(), &config.model, &config.risk_factors, &mut rng),
        None => ViewRiskModel::new(&config.model, &config.risk_factors, &mut rng),
    };
    let augmenter = Augmenter::new(&config.augmentation);
    let mut optimizer = Adam::new(stage.learning_rate, stage.weight_decay);
    log::info!(
        "{STAGE}: candidate {candidate} trains {} parameters on {} views (lr {}, weight decay {}).",
        model.num_params(),
        samples.len(),
        stage.learning_rate,
        stage.weight_decay
    );

    let mut best: Option<(ViewRiskModel, Option<f64>)> = None;
    let mut stale = 0usize;
    let mut steps = 0usize;
    let mut epochs = 0usize;
    let batch_size = stage.batch_size.max(1);

    for epoch in 1..=stage.epochs {
        epochs = epoch;
        samples.shuffle(&mut rng);
        let mut epoch_loss = 0.0;
        let mut epoch_count = 0usize;
        let mut budget_exhausted = false;

        for batch in samples.chunks(batch_size) {
            let seeds: Vec<u64> = batch.iter().map(|_| rng.next_u64()).collect();
            let zero = model.zeroed();
            let (loss, mut grads) = batch
                .par_iter()
                .zip(seeds.par_iter())
                .try_fold(
                    || (0.0, zero.clone()),
                    |(loss, mut grads), (sample, &sample_seed)| -> Result<(f64, ViewRiskModel), TrainError> {
                        let record = cohort.exam(sample.exam);
                        let image = load_png16(&record.paths[sample.view], shape).map_err(DataError::from)?;
                        let image = augmenter.apply(&image, &mut StdRng::seed_from_u64(sample_seed));
                        let trace = model.forward(&image, &record.resolved)?;
                        let (sample_loss, d_cumulative) = survival_nll(&trace.hazard.cumulative, sample.target);
                        model.backward(&trace, &d_cumulative, &mut grads);
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
            if !loss.is_finite() || !grads.is_finite() {
                return Err(TrainError::Diverged {
                    stage: STAGE,
                    epoch,
                    step: steps,
                });
            }
            let norm = clip_gradients(&mut grads, stage.gradient_clip);
            optimizer.step(&mut model, &grads);
            steps += 1;
            epoch_loss += loss;
            epoch_count += batch.len();
            log::debug!(
                "{STAGE}: candidate {candidate} epoch {epoch} step {steps}: loss {:.5}, grad norm {norm:.4}",
                loss / n
            );
            if stage.max_steps > 0 && steps >= stage.max_steps {
                budget_exhausted = true;
                break;
            }
        }

        let curves = view_model_curves(&model, cohort, &dev, shape)?;
        let labels: Vec<OutcomeLabel> = dev.iter().map(|&i| cohort.exam(i).label).collect();
        let c_index = concordance_index(&curves, &labels, horizons);
        let train_loss = epoch_loss / epoch_count.max(1) as f64;
        observer.on_epoch_end(&EpochSummary {
            stage: STAGE,
            candidate,
            epoch,
            steps,
            samples: epoch_count,
            train_loss,
            dev_c_index: c_index,
            adversary: None,
        });
        log::info!("{STAGE}: candidate {candidate} epoch {epoch}: train loss {train_loss:.5}, dev C-index {c_index:?}");

        let improved = match (c_index, best.as_ref().map(|(_, c)| *c)) {
            (_, None) => true,
            (Some(c), Some(Some(b))) => c > b,
            (Some(_), Some(None)) => true,
            (None, Some(_)) => false,
        };
        if improved {
            best = Some((model.clone(), c_index));
            stale = 0;
        } else {
            stale += 1;
        }

        if budget_exhausted {
            log::info!("{STAGE}: candidate {candidate} exhausted its step budget of {}.", stage.max_steps);
            break;
        }
        if stage.patience > 0 && stale >= stage.patience {
            log::info!("{STAGE}: candidate {candidate} stopped after {stale} epochs without improvement.");
            break;
        }
    }

    let (model, dev_c_index) = best.unwrap_or((model, None));
    observer.on_candidate_finish(STAGE, candidate, dev_c_index);
    Ok(Stage1Outcome {
        model,
        dev_c_index,
        epochs,
        steps,
    })
}

/// Exam-level risk curves from a per-view model: the cumulative hazards of the four
/// views are averaged, then turned into risk.
pub fn view_model_curves(
    model: &ViewRiskModel,
    cohort: &Cohort,
    exams: &[usize],
    shape: (usize, usize),
) -> Result<Vec<RiskCurve>, TrainError> {
    exams
        .par_iter()
        .map(|&index| -> Result<RiskCurve, TrainError> {
            let record = cohort.exam(index);
            let mut total = Array1::<f64>::zeros(model.hazard.horizons());
            for path in &record.paths {
                let image = load_png16(path, shape).map_err(DataError::from)?;
                total += &model.forward(&image, &record.resolved)?.hazard.cumulative;
            }
            Ok(RiskCurve::from_cumulative_hazard(&(total / 4.0))?)
        })
        .collect()
}
