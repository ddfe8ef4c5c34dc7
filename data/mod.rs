//! Dataset loading: the per-view CSV, exam assembly and 16-bit PNG images.

pub mod cohort;
pub mod dataset;
pub mod image;

use crate::risk_factors::RiskFactorError;
use crate::types::ExamError;
use thiserror::Error;

pub use self::image::ImageError;

/// A comprehensive error type for dataset loading and validation failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the CSV reader: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("The input file contains no usable exams.")]
    NoExams,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error(transparent)]
    RiskFactors(#[from] RiskFactorError),
}
