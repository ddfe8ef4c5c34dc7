//! Post-hoc probability calibration and discrimination metrics.

pub mod artifact;
pub mod isotonic;
pub mod metrics;

use crate::types::RiskCurveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no calibration data was provided")]
    NoData,
    #[error("no exams have a known outcome at year {year}")]
    NoEvaluableExams { year: usize },
    #[error("got {scores} scores but {outcomes} outcomes")]
    LengthMismatch { scores: usize, outcomes: usize },
    #[error("calibration scores must be finite")]
    NonFiniteScore,
    #[error("calibrator covers {expected} horizons, curve has {found}")]
    HorizonMismatch { expected: usize, found: usize },
    #[error("calibrator format version {found} is not supported (expected {expected})")]
    FormatVersion { expected: u32, found: u32 },
    #[error(transparent)]
    Curve(#[from] RiskCurveError),
    #[error("failed to read or write calibrator file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse calibrator TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize calibrator to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}
