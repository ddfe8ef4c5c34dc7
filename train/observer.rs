use crate::adversary::AdversaryStatus;
use std::fmt;

/// Training stages reported to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainingStage {
    Stage1Pretrain,
    Stage2Adversarial,
}

impl TrainingStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Stage1Pretrain => "per-view encoder pretraining",
            Self::Stage2Adversarial => "adversarial aggregator training",
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// What happened during one epoch of one sweep candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    pub stage: TrainingStage,
    pub candidate: usize,
    pub epoch: usize,
    pub steps: usize,
    /// Training samples consumed this epoch; fewer than the split when the step budget ran out.
    pub samples: usize,
    /// Mean loss over those samples.
    pub train_loss: f64,
    pub dev_c_index: Option<f64>,
    /// Adversary health at the end of the epoch; stage 2 only.
    pub adversary: Option<AdversaryStatus>,
}

/// Observer for reporting progress while training. Sweep candidates may run on
/// several threads at once, so callbacks take `&self`.
pub trait TrainingObserver: Send + Sync {
    fn on_stage_start(&self, stage: TrainingStage, candidates: usize, epochs: usize) {
        let _ = (stage, candidates, epochs);
    }
    fn on_epoch_end(&self, summary: &EpochSummary) {
        let _ = summary;
    }
    fn on_candidate_finish(&self, stage: TrainingStage, candidate: usize, dev_c_index: Option<f64>) {
        let _ = (stage, candidate, dev_c_index);
    }
    fn on_stage_finish(&self, stage: TrainingStage, best_c_index: Option<f64>) {
        let _ = (stage, best_c_index);
    }
}

#[derive(Default)]
pub struct NoopTrainingObserver;

impl TrainingObserver for NoopTrainingObserver {}
