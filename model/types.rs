//! Core value types shared by every stage of the pipeline.
//!
//! Everything in this module is a read-only input or output: exams and views are
//! built once from dataset records, labels are parsed once, and risk curves are
//! produced by the hazard head (or the calibrator) and never edited afterwards.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Sentinel value of `years_to_cancer` meaning "no cancer observed in the study window".
pub const CENSORING_SENTINEL: u32 = 100;

/// Which breast an image was taken of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Laterality {
    Left,
    Right,
}

impl Laterality {
    pub fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "L" | "l" => Some(Self::Left),
            "R" | "r" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Projection of a mammography image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViewKind {
    Cc,
    Mlo,
}

impl ViewKind {
    pub fn index(self) -> usize {
        match self {
            Self::Cc => 0,
            Self::Mlo => 1,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CC" => Some(Self::Cc),
            "MLO" => Some(Self::Mlo),
            _ => None,
        }
    }
}

/// One of the four required (laterality, view) positions of a screening exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewSlot {
    pub laterality: Laterality,
    pub kind: ViewKind,
}

impl ViewSlot {
    /// Canonical slot order: L-CC, L-MLO, R-CC, R-MLO.
    pub const ALL: [ViewSlot; 4] = [
        ViewSlot::new(Laterality::Left, ViewKind::Cc),
        ViewSlot::new(Laterality::Left, ViewKind::Mlo),
        ViewSlot::new(Laterality::Right, ViewKind::Cc),
        ViewSlot::new(Laterality::Right, ViewKind::Mlo),
    ];

    pub const fn new(laterality: Laterality, kind: ViewKind) -> Self {
        Self { laterality, kind }
    }

    pub fn position(self) -> usize {
        self.laterality.index() * 2 + self.kind.index()
    }
}

impl fmt::Display for ViewSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.laterality {
            Laterality::Left => "L",
            Laterality::Right => "R",
        };
        let view = match self.kind {
            ViewKind::Cc => "CC",
            ViewKind::Mlo => "MLO",
        };
        write!(f, "{side}-{view}")
    }
}

/// A single mammography image with its slot tags. Pixel data is shared, never mutated.
#[derive(Debug, Clone)]
pub struct View {
    pub slot: ViewSlot,
    pub pixels: Arc<Array2<f64>>,
    /// True when the image carries a CAD or annotation overlay.
    pub marked: bool,
}

impl View {
    pub fn new(slot: ViewSlot, pixels: Array2<f64>) -> Self {
        Self {
            slot,
            pixels: Arc::new(pixels),
            marked: false,
        }
    }

    pub fn with_marked(mut self, marked: bool) -> Self {
        self.marked = marked;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        self.pixels.dim()
    }
}

/// Identity of an exam. Displays as `patient_id<TAB>exam_id`, the prediction output key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExamKey {
    pub patient_id: String,
    pub exam_id: String,
}

impl ExamKey {
    pub fn new(patient_id: impl Into<String>, exam_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            exam_id: exam_id.into(),
        }
    }
}

impl fmt::Display for ExamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.patient_id, self.exam_id)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ExamError {
    #[error("exam {key}: required view {slot} is missing")]
    MissingView { key: String, slot: ViewSlot },
    #[error("exam {key}: view {slot} was supplied more than once")]
    DuplicateView { key: String, slot: ViewSlot },
    #[error("exam {key}: view {slot} carries an annotation overlay and cannot be used")]
    MarkedView { key: String, slot: ViewSlot },
    #[error("exam {key}: expected exactly 4 views, got {found}")]
    WrongViewCount { key: String, found: usize },
}

/// A complete screening exam: exactly one unmarked image per slot, in canonical order.
#[derive(Debug, Clone)]
pub struct Exam {
    key: ExamKey,
    views: [View; 4],
}

impl Exam {
    /// Builds an exam, rejecting anything other than one unmarked view per slot.
    pub fn new(key: ExamKey, views: Vec<View>) -> Result<Self, ExamError> {
        if views.len() != 4 {
            // Report the first absent slot when possible; it is the more actionable message.
            if views.len() < 4 {
                if let Some(slot) = ViewSlot::ALL
                    .iter()
                    .find(|slot| !views.iter().any(|v| v.slot == **slot))
                {
                    return Err(ExamError::MissingView {
                        key: key.to_string(),
                        slot: *slot,
                    });
                }
            }
            return Err(ExamError::WrongViewCount {
                key: key.to_string(),
                found: views.len(),
            });
        }

        let mut ordered: [Option<View>; 4] = [None, None, None, None];
        for view in views {
            if view.marked {
                return Err(ExamError::MarkedView {
                    key: key.to_string(),
                    slot: view.slot,
                });
            }
            let position = view.slot.position();
            if ordered[position].is_some() {
                return Err(ExamError::DuplicateView {
                    key: key.to_string(),
                    slot: view.slot,
                });
            }
            ordered[position] = Some(view);
        }

        let [a, b, c, d] = ordered;
        match (a, b, c, d) {
            (Some(a), Some(b), Some(c), Some(d)) => Ok(Self {
                key,
                views: [a, b, c, d],
            }),
            (a, b, c, d) => {
                let present = [a.is_some(), b.is_some(), c.is_some(), d.is_some()];
                let slot = ViewSlot::ALL[present.iter().position(|p| !p).unwrap_or(0)];
                Err(ExamError::MissingView {
                    key: key.to_string(),
                    slot,
                })
            }
        }
    }

    pub fn key(&self) -> &ExamKey {
        &self.key
    }

    /// Views in canonical slot order (L-CC, L-MLO, R-CC, R-MLO).
    pub fn views(&self) -> &[View; 4] {
        &self.views
    }

    pub fn view(&self, slot: ViewSlot) -> &View {
        &self.views[slot.position()]
    }
}

/// Follow-up outcome for one exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeLabel {
    /// 0 = detected at this exam, `CENSORING_SENTINEL` = not observed.
    pub years_to_cancer: u32,
    pub years_to_last_followup: u32,
}

impl OutcomeLabel {
    pub fn new(years_to_cancer: u32, years_to_last_followup: u32) -> Self {
        Self {
            years_to_cancer,
            years_to_last_followup,
        }
    }

    pub fn is_censored(&self) -> bool {
        self.years_to_cancer == CENSORING_SENTINEL
    }

    /// False when the diagnosis falls after the last follow-up.
    pub fn is_consistent(&self) -> bool {
        self.is_censored() || self.years_to_cancer <= self.years_to_last_followup
    }

    /// Index of the horizon in which the cancer was diagnosed, when it falls inside the window.
    pub fn event_index(&self, horizons: usize) -> Option<usize> {
        let years = self.years_to_cancer as usize;
        (!self.is_censored() && years < horizons).then_some(years)
    }

    /// Last horizon index the exam is known to be cancer-free through, for exams without an
    /// in-window event. `None` when follow-up is too short to say anything.
    pub fn censoring_index(&self, horizons: usize) -> Option<usize> {
        if self.event_index(horizons).is_some() {
            return None;
        }
        let followup = (self.years_to_last_followup as usize).min(horizons);
        followup.checked_sub(1)
    }

    /// Binary outcome at horizon `index`: `Some(true)` if diagnosed by then, `Some(false)` if
    /// followed cancer-free past it, `None` if the exam is not evaluable at that horizon.
    pub fn outcome_at(&self, index: usize, horizons: usize) -> Option<bool> {
        match self.event_index(horizons) {
            Some(event) if event <= index => Some(true),
            _ => {
                let cancer_free_through = if self.is_censored() {
                    self.years_to_last_followup as usize
                } else {
                    (self.years_to_last_followup as usize).min(self.years_to_cancer as usize)
                };
                (cancer_free_through > index).then_some(false)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskCurveError {
    #[error("risk curve must have at least one horizon")]
    Empty,
    #[error("risk value {value} at horizon {index} is outside [0, 1]")]
    OutOfRange { index: usize, value: f64 },
    #[error("risk curve decreases at horizon {index} ({previous} -> {value})")]
    Decreasing {
        index: usize,
        previous: f64,
        value: f64,
    },
}

/// Cumulative probability of diagnosis by each yearly horizon; non-decreasing, inside [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCurve(Array1<f64>);

impl RiskCurve {
    pub fn new(values: Array1<f64>) -> Result<Self, RiskCurveError> {
        if values.is_empty() {
            return Err(RiskCurveError::Empty);
        }
        let mut previous = 0.0;
        for (index, &value) in values.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(RiskCurveError::OutOfRange { index, value });
            }
            if index > 0 && value < previous {
                return Err(RiskCurveError::Decreasing {
                    index,
                    previous,
                    value,
                });
            }
            previous = value;
        }
        Ok(Self(values))
    }

    /// Risk at every horizon from a cumulative hazard, `1 - exp(-H)`.
    pub fn from_cumulative_hazard(cumulative: &Array1<f64>) -> Result<Self, RiskCurveError> {
        Self::new(cumulative.mapv(|h| (-(-h.max(0.0)).exp_m1()).clamp(0.0, 1.0)))
    }

    /// Forces monotonicity with a running maximum; used on per-horizon calibrated values.
    pub fn from_running_max(values: &Array1<f64>) -> Result<Self, RiskCurveError> {
        let mut running = 0.0f64;
        let monotone = values.mapv(|v| {
            running = running.max(v.clamp(0.0, 1.0));
            running
        });
        Self::new(monotone)
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.0
    }

    pub fn horizons(&self) -> usize {
        self.0.len()
    }

    pub fn at(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied()
    }

    /// Risk at the final horizon, the ranking score used for concordance.
    pub fn last(&self) -> f64 {
        self.0[self.0.len() - 1]
    }
}

/// Acquisition device identifier. Only ever used as an adversarial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceLabel(pub String);

/// Dataset partition an exam belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Self::Train),
            "dev" => Some(Self::Dev),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Dev => "dev",
            Self::Test => "test",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn blank_view(slot: ViewSlot) -> View {
        View::new(slot, Array2::zeros((4, 4)))
    }

    fn key() -> ExamKey {
        ExamKey::new("p1", "e1")
    }

    #[test]
    fn exam_orders_views_canonically() {
        let views = vec![
            blank_view(ViewSlot::ALL[3]),
            blank_view(ViewSlot::ALL[1]),
            blank_view(ViewSlot::ALL[0]),
            blank_view(ViewSlot::ALL[2]),
        ];
        let exam = Exam::new(key(), views).expect("complete exam");
        for (position, view) in exam.views().iter().enumerate() {
            assert_eq!(view.slot, ViewSlot::ALL[position]);
        }
    }

    #[test]
    fn exam_missing_any_view_is_rejected() {
        for missing in ViewSlot::ALL {
            let views: Vec<View> = ViewSlot::ALL
                .iter()
                .filter(|slot| **slot != missing)
                .map(|slot| blank_view(*slot))
                .collect();
            match Exam::new(key(), views) {
                Err(ExamError::MissingView { slot, .. }) => assert_eq!(slot, missing),
                other => panic!("expected missing view error, got {other:?}"),
            }
        }
    }

    #[test]
    fn exam_with_duplicate_slot_is_rejected() {
        let views = vec![
            blank_view(ViewSlot::ALL[0]),
            blank_view(ViewSlot::ALL[0]),
            blank_view(ViewSlot::ALL[2]),
            blank_view(ViewSlot::ALL[3]),
        ];
        assert!(matches!(
            Exam::new(key(), views),
            Err(ExamError::DuplicateView { .. })
        ));
    }

    #[test]
    fn exam_with_marked_view_is_rejected() {
        let mut views: Vec<View> = ViewSlot::ALL.iter().map(|s| blank_view(*s)).collect();
        views[2] = views[2].clone().with_marked(true);
        assert!(matches!(
            Exam::new(key(), views),
            Err(ExamError::MarkedView { .. })
        ));
    }

    #[test]
    fn exam_key_displays_with_tab() {
        assert_eq!(key().to_string(), "p1\te1");
    }

    #[test]
    fn outcome_indices_follow_label_semantics() {
        let detected_now = OutcomeLabel::new(0, 3);
        assert_eq!(detected_now.event_index(5), Some(0));
        assert_eq!(detected_now.outcome_at(0, 5), Some(true));

        let censored = OutcomeLabel::new(CENSORING_SENTINEL, 3);
        assert_eq!(censored.event_index(5), None);
        assert_eq!(censored.censoring_index(5), Some(2));
        assert_eq!(censored.outcome_at(2, 5), Some(false));
        assert_eq!(censored.outcome_at(3, 5), None);

        let no_followup = OutcomeLabel::new(CENSORING_SENTINEL, 0);
        assert_eq!(no_followup.censoring_index(5), None);

        let late_cancer = OutcomeLabel::new(7, 8);
        assert_eq!(late_cancer.event_index(5), None);
        assert_eq!(late_cancer.censoring_index(5), Some(4));
        assert_eq!(late_cancer.outcome_at(4, 5), Some(false));
    }

    #[test]
    fn diagnosis_after_followup_is_inconsistent() {
        assert!(OutcomeLabel::new(2, 2).is_consistent());
        assert!(OutcomeLabel::new(CENSORING_SENTINEL, 1).is_consistent());
        assert!(!OutcomeLabel::new(3, 2).is_consistent());
    }

    #[test]
    fn risk_curve_rejects_decreasing_values() {
        assert!(RiskCurve::new(array![0.1, 0.2, 0.15]).is_err());
        assert!(RiskCurve::new(array![0.1, 1.2]).is_err());
        assert!(RiskCurve::new(array![0.1, 0.1, 0.3]).is_ok());
    }

    #[test]
    fn running_max_restores_monotonicity() {
        let curve = RiskCurve::from_running_max(&array![0.2, 0.1, 0.4, 0.3]).unwrap();
        assert_eq!(curve.values(), &array![0.2, 0.2, 0.4, 0.4]);
    }
}
