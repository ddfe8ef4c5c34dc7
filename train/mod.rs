//! The two-stage training protocol.
//!
//! Stage 1 trains the image encoder per view; stage 2 freezes it and trains the
//! aggregator, risk-factor encoder and hazard head against a device adversary.
//! [`orchestrator::run_protocol`] drives the whole thing.

pub mod augment;
pub mod loss;
pub mod observer;
pub mod optim;
pub mod orchestrator;
pub mod schedule;
pub mod stage1;
pub mod stage2;
pub mod sweep;

use crate::calibrate::CalibrationError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::risk_model::ModelError;
use crate::snapshot::SnapshotError;
use crate::types::RiskCurveError;
use observer::TrainingStage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Curve(#[from] RiskCurveError),
    #[error("{stage}: the {split} split has no usable exams")]
    NoExams { stage: TrainingStage, split: &'static str },
    #[error("{stage}: loss became non-finite at epoch {epoch}, step {step}")]
    Diverged {
        stage: TrainingStage,
        epoch: usize,
        step: usize,
    },
    #[error("{stage}: every sweep candidate failed")]
    NoCandidates { stage: TrainingStage },
}
