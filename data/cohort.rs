//! A loaded dataset: assembled exams, their splits and per-patient history.

use crate::adversary::DeviceVocabulary;
use crate::data::DataError;
use crate::data::dataset::{ExamAssembler, ExamRecord, Rejection, read_view_records};
use crate::data::image::load_png16;
use crate::risk_factors::RiskFactorSchema;
use crate::types::{Exam, Split, View, ViewSlot};
use ahash::AHashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Cohort {
    exams: Vec<ExamRecord>,
    rejected: Vec<Rejection>,
    by_patient: AHashMap<String, Vec<usize>>,
}

impl Cohort {
    /// Reads the dataset CSV and assembles it. Exams that fail validation are
    /// excluded and available through [`Cohort::rejected`].
    pub fn load(csv_path: &Path, schema: &RiskFactorSchema) -> Result<Self, DataError> {
        let records = read_view_records(csv_path, schema)?;
        let assembly = ExamAssembler::new(schema).assemble(records);
        if assembly.exams.is_empty() {
            return Err(DataError::NoExams);
        }
        Ok(Self::from_exams(assembly.exams, assembly.rejected))
    }

    pub fn from_exams(exams: Vec<ExamRecord>, rejected: Vec<Rejection>) -> Self {
        let mut by_patient: AHashMap<String, Vec<usize>> = AHashMap::new();
        for (index, exam) in exams.iter().enumerate() {
            by_patient.entry(exam.key.patient_id.clone()).or_default().push(index);
        }
        Self {
            exams,
            rejected,
            by_patient,
        }
    }

    pub fn exams(&self) -> &[ExamRecord] {
        &self.exams
    }

    pub fn exam(&self, index: usize) -> &ExamRecord {
        &self.exams[index]
    }

    pub fn len(&self) -> usize {
        self.exams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exams.is_empty()
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    /// Indices of the exams in one split, in cohort order.
    pub fn split(&self, split: Split) -> Vec<usize> {
        self.exams
            .iter()
            .enumerate()
            .filter(|(_, exam)| exam.split == split)
            .map(|(index, _)| index)
            .collect()
    }

    /// Earlier exams of the same patient, most recent first, at most `limit` of them.
    /// Exams without an `exam_index` have no history.
    pub fn priors_of(&self, index: usize, limit: usize) -> Vec<usize> {
        let exam = &self.exams[index];
        let Some(position) = exam.exam_index else {
            return Vec::new();
        };
        let mut earlier: Vec<(i64, usize)> = self
            .by_patient
            .get(&exam.key.patient_id)
            .into_iter()
            .flatten()
            .filter_map(|&other| {
                self.exams[other]
                    .exam_index
                    .filter(|&p| p < position)
                    .map(|p| (p, other))
            })
            .collect();
        earlier.sort_by(|a, b| b.0.cmp(&a.0));
        earlier.into_iter().take(limit).map(|(_, other)| other).collect()
    }

    /// Device vocabulary over the exams that carry a device label.
    pub fn devices(&self) -> DeviceVocabulary {
        DeviceVocabulary::from_labels(self.exams.iter().filter_map(|e| e.device.as_ref()))
    }
}

/// Loads the four images of an exam at the given (height, width).
pub fn load_exam(record: &ExamRecord, shape: (usize, usize)) -> Result<Exam, DataError> {
    let mut views = Vec::with_capacity(4);
    for (slot, path) in ViewSlot::ALL.iter().zip(&record.paths) {
        views.push(View::new(*slot, load_png16(path, shape)?));
    }
    Ok(Exam::new(record.key.clone(), views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk_factors::{ResolvedRiskFactors, RiskFactorVector};
    use crate::types::{ExamKey, OutcomeLabel};
    use crate::data::image::save_png16;
    use ndarray::Array2;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn record(patient: &str, exam: &str, exam_index: Option<i64>, split: Split) -> ExamRecord {
        ExamRecord {
            key: ExamKey::new(patient, exam),
            paths: std::array::from_fn(|i| PathBuf::from(format!("{exam}_{i}.png"))),
            label: OutcomeLabel::new(100, 3),
            split,
            device: None,
            exam_index,
            risk_factors: RiskFactorVector::new(),
            resolved: ResolvedRiskFactors::all_missing(0),
        }
    }

    #[test]
    fn priors_are_earlier_exams_most_recent_first() {
        let cohort = Cohort::from_exams(
            vec![
                record("p1", "a", Some(1), Split::Train),
                record("p1", "b", Some(3), Split::Train),
                record("p2", "c", Some(0), Split::Dev),
                record("p1", "d", Some(2), Split::Train),
                record("p1", "e", Some(4), Split::Test),
                record("p1", "f", None, Split::Test),
            ],
            Vec::new(),
        );
        assert_eq!(cohort.priors_of(4, 2), vec![1, 3]);
        assert_eq!(cohort.priors_of(4, 10), vec![1, 3, 0]);
        assert!(cohort.priors_of(0, 2).is_empty());
        assert!(cohort.priors_of(5, 2).is_empty());
        assert!(cohort.priors_of(2, 2).is_empty());
        assert_eq!(cohort.split(Split::Test), vec![4, 5]);
    }

    #[test]
    fn exam_images_load_in_slot_order() {
        let dir = tempdir().unwrap();
        let mut exam = record("p1", "a", None, Split::Train);
        for (i, path) in exam.paths.iter_mut().enumerate() {
            *path = dir.path().join(format!("{i}.png"));
            save_png16(path, &Array2::from_elem((3, 2), (i * 100) as f64)).unwrap();
        }
        let loaded = load_exam(&exam, (3, 2)).unwrap();
        for (i, view) in loaded.views().iter().enumerate() {
            assert_eq!(view.slot, ViewSlot::ALL[i]);
            assert_eq!(view.pixels[[0, 0]], (i * 100) as f64);
        }
        assert!(matches!(load_exam(&exam, (4, 2)), Err(DataError::Image(_))));
    }
}
