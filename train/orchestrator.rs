//! The training protocol as an explicit state machine:
//! `Stage1Pretrain -> Stage2Adversarial -> Done`.

use crate::config::ExperimentConfig;
use crate::data::cohort::Cohort;
use crate::snapshot::{EncoderSnapshot, FullSnapshot};
use crate::train::TrainError;
use crate::train::observer::{TrainingObserver, TrainingStage};
use crate::train::stage1::train_stage1;
use crate::train::stage2::{EmbeddingCache, train_stage2};
use crate::train::sweep::{candidates, run_sweep};
use std::path::{Path, PathBuf};

/// Seed offset separating stage-2 candidate seeds from stage-1 ones.
const STAGE2_SEED_OFFSET: u64 = 0x9E37_79B9;

pub const ENCODER_SNAPSHOT_FILE: &str = "encoder.toml";
pub const MODEL_SNAPSHOT_FILE: &str = "model.toml";

#[derive(Debug, Clone)]
pub enum ProtocolState {
    Stage1Pretrain,
    /// Stage 2 can only be entered with a materialized encoder.
    Stage2Adversarial { encoder: EncoderSnapshot },
    Done { snapshot: FullSnapshot },
}

impl ProtocolState {
    pub fn stage(&self) -> Option<TrainingStage> {
        match self {
            Self::Stage1Pretrain => Some(TrainingStage::Stage1Pretrain),
            Self::Stage2Adversarial { .. } => Some(TrainingStage::Stage2Adversarial),
            Self::Done { .. } => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Everything a protocol run needs besides the state itself.
pub struct Protocol<'a> {
    config: &'a ExperimentConfig,
    cohort: &'a Cohort,
    observer: &'a dyn TrainingObserver,
    initial_encoder: Option<EncoderSnapshot>,
    snapshot_dir: Option<PathBuf>,
}

impl<'a> Protocol<'a> {
    pub fn new(config: &'a ExperimentConfig, cohort: &'a Cohort, observer: &'a dyn TrainingObserver) -> Self {
        Self {
            config,
            cohort,
            observer,
            initial_encoder: None,
            snapshot_dir: None,
        }
    }

    /// Starts stage 1 from a supplied encoder instead of random weights.
    pub fn with_initial_encoder(mut self, encoder: EncoderSnapshot) -> Self {
        self.initial_encoder = Some(encoder);
        self
    }

    /// Persists the snapshot of each stage into `dir` as it completes.
    pub fn with_snapshot_dir(mut self, dir: &Path) -> Self {
        self.snapshot_dir = Some(dir.to_path_buf());
        self
    }

    /// Runs one transition.
    pub fn advance(&self, state: ProtocolState) -> Result<ProtocolState, TrainError> {
        match state {
            ProtocolState::Stage1Pretrain => {
                let encoder = self.pretrain()?;
                if let Some(dir) = &self.snapshot_dir {
                    encoder.save(&dir.join(ENCODER_SNAPSHOT_FILE))?;
                }
                Ok(ProtocolState::Stage2Adversarial { encoder })
            }
            ProtocolState::Stage2Adversarial { encoder } => {
                let snapshot = self.train_adversarial(encoder)?;
                if let Some(dir) = &self.snapshot_dir {
                    snapshot.save(&dir.join(MODEL_SNAPSHOT_FILE))?;
                }
                Ok(ProtocolState::Done { snapshot })
            }
            done @ ProtocolState::Done { .. } => Ok(done),
        }
    }

    /// Drives `state` until it reaches `Done`.
    pub fn run_from(&self, mut state: ProtocolState) -> Result<FullSnapshot, TrainError> {
        loop {
            state = match self.advance(state)? {
                ProtocolState::Done { snapshot } => return Ok(snapshot),
                next => next,
            };
        }
    }

    /// Stage 1 sweep; returns the encoder of the best candidate.
    pub fn pretrain(&self) -> Result<EncoderSnapshot, TrainError> {
        let stage = TrainingStage::Stage1Pretrain;
        let grid = candidates(&self.config.stage1, &self.config.sweep);
        log::info!("Starting {stage} with {} candidate(s).", grid.len());
        self.observer.on_stage_start(stage, grid.len(), self.config.stage1.epochs);
        let initial = self.initial_encoder.as_ref().map(|snapshot| &snapshot.encoder);
        let (_, outcome) = run_sweep(stage, grid, |candidate| {
            train_stage1(
                self.cohort,
                self.config,
                &candidate.stage,
                initial,
                candidate.index,
                self.config.seed.wrapping_add(candidate.index as u64),
                self.observer,
            )
        })?;
        self.observer.on_stage_finish(stage, outcome.dev_c_index);
        Ok(EncoderSnapshot::new(
            &self.config.model_version,
            &self.config.model,
            outcome.model.encoder,
            outcome.dev_c_index,
        ))
    }

    /// Stage 2 sweep against a frozen encoder; returns the best full snapshot.
    pub fn train_adversarial(&self, encoder: EncoderSnapshot) -> Result<FullSnapshot, TrainError> {
        let stage = TrainingStage::Stage2Adversarial;
        let frozen = encoder.freeze();
        let cache = EmbeddingCache::build(&frozen, self.cohort);
        let grid = candidates(&self.config.stage2, &self.config.sweep);
        log::info!("Starting {stage} with {} candidate(s).", grid.len());
        self.observer.on_stage_start(stage, grid.len(), self.config.stage2.epochs);
        let (_, outcome) = run_sweep(stage, grid, |candidate| {
            train_stage2(
                self.cohort,
                &cache,
                self.config,
                &candidate.stage,
                candidate.index,
                self.config
                    .seed
                    .wrapping_add(STAGE2_SEED_OFFSET)
                    .wrapping_add(candidate.index as u64),
                self.observer,
            )
        })?;
        self.observer.on_stage_finish(stage, outcome.dev_c_index);
        log::info!(
            "{stage} finished: dev C-index {:?}, adversary {:?}.",
            outcome.dev_c_index,
            outcome.adversary_status
        );
        Ok(FullSnapshot::new(
            &self.config.model_version,
            &self.config.risk_factors,
            encoder,
            outcome.model,
            outcome.devices,
            outcome.adversary,
            outcome.dev_c_index,
        ))
    }
}

/// Runs the full protocol from stage 1.
pub fn run_protocol(protocol: &Protocol<'_>) -> Result<FullSnapshot, TrainError> {
    protocol.run_from(ProtocolState::Stage1Pretrain)
}
