//! Per-horizon calibrator set, fitted once on held-out predictions and persisted as TOML.

use crate::calibrate::CalibrationError;
use crate::calibrate::isotonic::{ClampSide, IsotonicCalibrator};
use crate::types::{OutcomeLabel, RiskCurve};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const CALIBRATOR_FORMAT_VERSION: u32 = 1;

/// A calibrated curve with the clamp flag of every horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedCurve {
    pub curve: RiskCurve,
    pub clamped: Vec<Option<ClampSide>>,
}

impl CalibratedCurve {
    pub fn clamp_count(&self) -> usize {
        self.clamped.iter().filter(|c| c.is_some()).count()
    }
}

/// One isotonic calibrator per horizon, tied to the model version it was fitted for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorSet {
    pub format_version: u32,
    pub model_version: String,
    pub horizons: Vec<IsotonicCalibrator>,
}

impl CalibratorSet {
    /// Fits every horizon from raw curves and labels of a held-out split.
    ///
    /// At horizon `k` an exam contributes only if its outcome at `k` is known (see
    /// [`OutcomeLabel::outcome_at`]).
    pub fn fit(model_version: &str, curves: &[RiskCurve], labels: &[OutcomeLabel]) -> Result<Self, CalibrationError> {
        if curves.len() != labels.len() {
            return Err(CalibrationError::LengthMismatch {
                scores: curves.len(),
                outcomes: labels.len(),
            });
        }
        let horizons = curves.first().map(RiskCurve::horizons).ok_or(CalibrationError::NoData)?;
        if let Some(bad) = curves.iter().find(|c| c.horizons() != horizons) {
            return Err(CalibrationError::HorizonMismatch {
                expected: horizons,
                found: bad.horizons(),
            });
        }

        let mut fitted = Vec::with_capacity(horizons);
        for index in 0..horizons {
            let mut scores = Vec::new();
            let mut outcomes = Vec::new();
            for (curve, label) in curves.iter().zip(labels) {
                if let (Some(outcome), Some(score)) = (label.outcome_at(index, horizons), curve.at(index)) {
                    scores.push(score);
                    outcomes.push(outcome);
                }
            }
            log::info!(
                "Fitting calibrator for year {} on {} exams ({} positive).",
                index + 1,
                scores.len(),
                outcomes.iter().filter(|o| **o).count()
            );
            let calibrator = IsotonicCalibrator::fit(&scores, &outcomes).map_err(|e| match e {
                CalibrationError::NoData => CalibrationError::NoEvaluableExams { year: index + 1 },
                other => other,
            })?;
            fitted.push(calibrator);
        }
        Ok(Self {
            format_version: CALIBRATOR_FORMAT_VERSION,
            model_version: model_version.to_string(),
            horizons: fitted,
        })
    }

    pub fn num_horizons(&self) -> usize {
        self.horizons.len()
    }

    /// Calibrates every horizon, then restores monotonicity across horizons with a
    /// running maximum.
    pub fn apply(&self, raw: &RiskCurve) -> Result<CalibratedCurve, CalibrationError> {
        if raw.horizons() != self.horizons.len() {
            return Err(CalibrationError::HorizonMismatch {
                expected: self.horizons.len(),
                found: raw.horizons(),
            });
        }
        let mut clamped = Vec::with_capacity(raw.horizons());
        let values = raw
            .values()
            .iter()
            .zip(&self.horizons)
            .map(|(&score, calibrator)| {
                let calibrated = calibrator.apply(score);
                clamped.push(calibrated.clamped);
                calibrated.value
            })
            .collect::<ndarray::Array1<f64>>();
        let curve = RiskCurve::from_running_max(&values)?;
        for (index, flag) in clamped.iter().enumerate() {
            if let Some(side) = flag {
                log::warn!(
                    "Raw year {} risk {:.6} is outside the calibrated range; clamped {:?}.",
                    index + 1,
                    raw.values()[index],
                    side
                );
            }
        }
        Ok(CalibratedCurve { curve, clamped })
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let toml_string = fs::read_to_string(path)?;
        let set: Self = toml::from_str(&toml_string)?;
        if set.format_version != CALIBRATOR_FORMAT_VERSION {
            return Err(CalibrationError::FormatVersion {
                expected: CALIBRATOR_FORMAT_VERSION,
                found: set.format_version,
            });
        }
        Ok(set)
    }
}
