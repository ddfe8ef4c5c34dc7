//! Inference on a trained full snapshot, optionally followed by calibration.

use crate::aggregator::ExamEmbeddings;
use crate::calibrate::CalibrationError;
use crate::calibrate::artifact::{CalibratedCurve, CalibratorSet};
use crate::calibrate::metrics::{HorizonAuc, concordance_index, per_horizon_auc};
use crate::config::EvaluationConfig;
use crate::data::DataError;
use crate::data::cohort::{Cohort, load_exam};
use crate::encoder::{EncoderError, FrozenEncoder};
use crate::risk_factors::{RiskFactorError, RiskFactorVector};
use crate::risk_model::ModelError;
use crate::snapshot::{FullSnapshot, SnapshotError};
use crate::types::{Exam, ExamKey, OutcomeLabel, RiskCurve, RiskCurveError, Split};
use rayon::prelude::*;
use std::fmt;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    RiskFactors(#[from] RiskFactorError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Curve(#[from] RiskCurveError),
    #[error("failed to write predictions: {0}")]
    Output(#[from] csv::Error),
    #[error("calibrator was fit for model version '{calibrator}', the loaded model is '{model}'")]
    VersionMismatch { model: String, calibrator: String },
    #[error("no exam of the {split} split could be scored")]
    NoExams { split: Split },
}

/// Risk curves of one exam.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub key: ExamKey,
    pub raw: RiskCurve,
    pub calibrated: Option<CalibratedCurve>,
}

impl Prediction {
    /// The curve to report: calibrated when a calibrator was applied.
    pub fn curve(&self) -> &RiskCurve {
        self.calibrated.as_ref().map_or(&self.raw, |c| &c.curve)
    }

    /// `"Year N"` to probability, rounded to four decimals.
    pub fn report(&self) -> Vec<(String, f64)> {
        self.curve()
            .values()
            .iter()
            .enumerate()
            .map(|(i, &p)| (format!("Year {}", i + 1), (p * 10_000.0).round() / 10_000.0))
            .collect()
    }
}

/// First-year risk reported for exams whose cancer was found at that screening.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenDetectedSummary {
    pub exams: usize,
    pub minimum: f64,
    pub below_minimum: usize,
    pub lowest: Option<f64>,
}

impl ScreenDetectedSummary {
    fn collect<'a>(scored: impl Iterator<Item = (&'a Prediction, &'a OutcomeLabel)>, minimum: f64) -> Self {
        let risks: Vec<f64> = scored
            .filter(|(_, label)| label.event_index(1) == Some(0))
            .map(|(prediction, _)| prediction.curve().values()[0])
            .collect();
        Self {
            exams: risks.len(),
            minimum,
            below_minimum: risks.iter().filter(|&&risk| risk < minimum).count(),
            lowest: risks.iter().copied().reduce(f64::min),
        }
    }
}

/// Discrimination of a model on one split.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub split: Split,
    pub exams: usize,
    pub failed: usize,
    pub per_horizon: Vec<HorizonAuc>,
    pub c_index: Option<f64>,
    pub clamped: usize,
    pub screen_detected: ScreenDetectedSummary,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "split: {} ({} exams scored, {} failed)", self.split, self.exams, self.failed)?;
        for horizon in &self.per_horizon {
            match horizon.auc {
                Some(auc) => writeln!(
                    f,
                    "year {}: AUC {auc:.4} ({} positive, {} negative)",
                    horizon.year, horizon.positives, horizon.negatives
                )?,
                None => writeln!(
                    f,
                    "year {}: AUC undefined ({} positive, {} negative)",
                    horizon.year, horizon.positives, horizon.negatives
                )?,
            }
        }
        match self.c_index {
            Some(c) => writeln!(f, "C-index: {c:.4}")?,
            None => writeln!(f, "C-index: undefined")?,
        }
        writeln!(f, "calibration clamps: {}", self.clamped)?;
        let screen = &self.screen_detected;
        write!(
            f,
            "screen-detected: {} exams, {} below the year 1 minimum of {:.4}",
            screen.exams, screen.below_minimum, screen.minimum
        )
    }
}

/// A loaded full model plus an optional calibrator.
#[derive(Debug, Clone)]
pub struct RiskPredictor {
    snapshot: FullSnapshot,
    encoder: FrozenEncoder,
    calibrator: Option<CalibratorSet>,
}

impl RiskPredictor {
    pub fn new(snapshot: FullSnapshot) -> Self {
        let encoder = snapshot.encoder.freeze();
        Self {
            snapshot,
            encoder,
            calibrator: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, PredictError> {
        Ok(Self::new(FullSnapshot::load(path)?))
    }

    /// Attaches a calibrator. It must have been fit on this model version.
    pub fn with_calibrator(mut self, calibrator: CalibratorSet) -> Result<Self, PredictError> {
        if calibrator.model_version != self.snapshot.model_version {
            return Err(PredictError::VersionMismatch {
                model: self.snapshot.model_version.clone(),
                calibrator: calibrator.model_version,
            });
        }
        if calibrator.num_horizons() != self.snapshot.horizons {
            return Err(CalibrationError::HorizonMismatch {
                expected: self.snapshot.horizons,
                found: calibrator.num_horizons(),
            }
            .into());
        }
        self.calibrator = Some(calibrator);
        Ok(self)
    }

    pub fn snapshot(&self) -> &FullSnapshot {
        &self.snapshot
    }

    pub fn calibrator(&self) -> Option<&CalibratorSet> {
        self.calibrator.as_ref()
    }

    pub fn horizons(&self) -> usize {
        self.snapshot.horizons
    }

    /// Priors fed to the aggregator per exam; zero when history is disabled.
    fn history(&self) -> usize {
        let model = &self.snapshot.encoder.model;
        if model.use_history { model.max_prior_exams } else { 0 }
    }

    fn embed(&self, exam: &Exam) -> Result<ExamEmbeddings, PredictError> {
        let mut embeddings = ExamEmbeddings::default();
        for (slot, view) in embeddings.iter_mut().zip(exam.views()) {
            *slot = self.encoder.encode(&view.pixels)?;
        }
        Ok(embeddings)
    }

    /// Scores one exam. `priors` are earlier exams of the same patient, most recent
    /// first; any beyond the configured history length are ignored.
    pub fn predict_exam(
        &self,
        exam: &Exam,
        factors: &RiskFactorVector,
        priors: &[Exam],
    ) -> Result<Prediction, PredictError> {
        let resolved = self.snapshot.schema.resolve(factors)?;
        let current = self.embed(exam)?;
        let priors = priors
            .iter()
            .take(self.history())
            .map(|prior| self.embed(prior))
            .collect::<Result<Vec<_>, _>>()?;
        let raw = self.snapshot.model.forward(&current, &priors, &resolved)?.hazard.curve()?;
        let calibrated = match &self.calibrator {
            Some(calibrator) => Some(calibrator.apply(&raw)?),
            None => None,
        };
        Ok(Prediction {
            key: exam.key().clone(),
            raw,
            calibrated,
        })
    }

    /// Scores the cohort exams at `indices` in parallel. Exams that fail are logged
    /// and left out; the survivors keep their cohort index.
    pub fn predict_cohort(&self, cohort: &Cohort, indices: &[usize]) -> Vec<(usize, Prediction)> {
        let shape = self.encoder.input_shape();
        indices
            .par_iter()
            .filter_map(|&index| {
                let record = cohort.exam(index);
                let scored = (|| -> Result<Prediction, PredictError> {
                    let exam = load_exam(record, shape)?;
                    let priors = cohort
                        .priors_of(index, self.history())
                        .into_iter()
                        .map(|p| load_exam(cohort.exam(p), shape))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.predict_exam(&exam, &record.risk_factors, &priors)
                })();
                match scored {
                    Ok(prediction) => Some((index, prediction)),
                    Err(e) => {
                        log::warn!("Could not score exam {}: {e}", record.key);
                        None
                    }
                }
            })
            .collect()
    }

    /// Scores every exam of a split.
    pub fn predict_split(&self, cohort: &Cohort, split: Split) -> Result<Vec<(usize, Prediction)>, PredictError> {
        let scored = self.predict_cohort(cohort, &cohort.split(split));
        if scored.is_empty() {
            return Err(PredictError::NoExams { split });
        }
        Ok(scored)
    }

    /// Fits one isotonic calibrator per horizon on the raw curves of a held-out split.
    pub fn fit_calibrator(&self, cohort: &Cohort, split: Split) -> Result<CalibratorSet, PredictError> {
        let scored = self.predict_split(cohort, split)?;
        let curves: Vec<RiskCurve> = scored.iter().map(|(_, p)| p.raw.clone()).collect();
        let labels: Vec<OutcomeLabel> = scored.iter().map(|(i, _)| cohort.exam(*i).label).collect();
        log::info!(
            "Fitting calibrators for model '{}' on {} {split} exams.",
            self.snapshot.model_version,
            curves.len()
        );
        Ok(CalibratorSet::fit(&self.snapshot.model_version, &curves, &labels)?)
    }

    /// Per-horizon AUC and C-index of the reported curves on a split.
    /// Scores a split and summarizes discrimination, calibration clamps and the
    /// first-year risk given to screen-detected cancers.
    pub fn evaluate(
        &self,
        cohort: &Cohort,
        split: Split,
        settings: &EvaluationConfig,
    ) -> Result<EvaluationReport, PredictError> {
        let indices = cohort.split(split);
        let scored = self.predict_split(cohort, split)?;
        let curves: Vec<RiskCurve> = scored.iter().map(|(_, p)| p.curve().clone()).collect();
        let labels: Vec<OutcomeLabel> = scored.iter().map(|(i, _)| cohort.exam(*i).label).collect();
        let horizons = self.horizons();
        let screen_detected = ScreenDetectedSummary::collect(
            scored.iter().map(|(_, p)| p).zip(&labels),
            settings.min_screen_detected_risk,
        );
        if screen_detected.below_minimum > 0 {
            log::warn!(
                "{} of {} screen-detected exams in the {} split score below {:.4} at year 1.",
                screen_detected.below_minimum,
                screen_detected.exams,
                split,
                screen_detected.minimum
            );
        }
        Ok(EvaluationReport {
            split,
            exams: scored.len(),
            failed: indices.len() - scored.len(),
            per_horizon: per_horizon_auc(&curves, &labels, horizons),
            c_index: concordance_index(&curves, &labels, horizons),
            clamped: scored
                .iter()
                .filter_map(|(_, p)| p.calibrated.as_ref())
                .map(CalibratedCurve::clamp_count)
                .sum(),
            screen_detected,
        })
    }
}

/// Writes one tab-separated row per exam: the exam key followed by the reported
/// probability at each horizon.
pub fn write_predictions<W: Write>(writer: W, predictions: &[Prediction], horizons: usize) -> Result<(), PredictError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    let mut header = vec!["patient_id".to_string(), "exam_id".to_string()];
    header.extend((1..=horizons).map(|year| format!("year_{year}")));
    header.push("calibrated".to_string());
    out.write_record(&header)?;
    for prediction in predictions {
        let mut row = vec![prediction.key.patient_id.clone(), prediction.key.exam_id.clone()];
        row.extend(prediction.report().into_iter().map(|(_, p)| format!("{p:.4}")));
        row.push(prediction.calibrated.is_some().to_string());
        out.write_record(&row)?;
    }
    out.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn prediction(values: ndarray::Array1<f64>) -> Prediction {
        Prediction {
            key: ExamKey::new("p1", "e1"),
            raw: RiskCurve::new(values).unwrap(),
            calibrated: None,
        }
    }

    #[test]
    fn report_rounds_to_four_decimals() {
        let report = prediction(array![0.012345, 0.02, 0.03, 0.04, 0.123456]).report();
        assert_eq!(report.len(), 5);
        assert_eq!(report[0].0, "Year 1");
        assert_eq!(report[4].0, "Year 5");
        assert_abs_diff_eq!(report[0].1, 0.0123, epsilon = 1e-12);
        assert_abs_diff_eq!(report[4].1, 0.1235, epsilon = 1e-12);
    }

    #[test]
    fn predictions_are_written_as_tab_separated_rows() {
        let mut buffer = Vec::new();
        write_predictions(&mut buffer, &[prediction(array![0.1, 0.2, 0.3])], 3).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "patient_id\texam_id\tyear_1\tyear_2\tyear_3\tcalibrated");
        assert_eq!(lines[1], "p1\te1\t0.1000\t0.2000\t0.3000\tfalse");
    }

    #[test]
    fn screen_detected_summary_counts_first_year_risks_below_the_minimum() {
        let predictions = [
            prediction(array![0.02, 0.1, 0.2]),
            prediction(array![0.4, 0.5, 0.6]),
            prediction(array![0.01, 0.02, 0.03]),
            prediction(array![0.0, 0.3, 0.3]),
        ];
        let labels = [
            OutcomeLabel::new(0, 3),
            OutcomeLabel::new(0, 3),
            OutcomeLabel::new(100, 3),
            OutcomeLabel::new(1, 3),
        ];
        let summary = ScreenDetectedSummary::collect(predictions.iter().zip(&labels), 0.05);
        assert_eq!(summary.exams, 2);
        assert_eq!(summary.below_minimum, 1);
        assert_eq!(summary.lowest, Some(0.02));
    }
}
