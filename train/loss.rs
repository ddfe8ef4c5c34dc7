//! Discrete-time right-censored survival likelihood over the additive hazard curve.

use crate::types::OutcomeLabel;
use ndarray::Array1;

/// Smallest hazard increment allowed inside the event log-likelihood.
const MIN_INCREMENT: f64 = 1e-12;

/// What one label says about the cumulative hazard curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurvivalTarget {
    /// Diagnosed during horizon `index`.
    Event { index: usize },
    /// Known cancer-free through horizon `index`.
    Censored { index: usize },
    /// Follow-up too short to supervise any horizon.
    Uninformative,
}

impl SurvivalTarget {
    pub fn from_label(label: &OutcomeLabel, horizons: usize) -> Self {
        if let Some(index) = label.event_index(horizons) {
            return Self::Event { index };
        }
        match label.censoring_index(horizons) {
            Some(index) => Self::Censored { index },
            None => Self::Uninformative,
        }
    }

    pub fn is_informative(&self) -> bool {
        !matches!(self, Self::Uninformative)
    }
}

/// Negative log-likelihood and its gradient with respect to each `H_k`.
///
/// Event at `e`: `-ln(exp(-H_{e-1}) - exp(-H_e))` with `H_{-1} = 0`.
/// Censored through `c`: `H_c`.
pub fn survival_nll(cumulative: &Array1<f64>, target: SurvivalTarget) -> (f64, Array1<f64>) {
    let mut grad = Array1::zeros(cumulative.len());
    match target {
        SurvivalTarget::Uninformative => (0.0, grad),
        SurvivalTarget::Censored { index } => {
            grad[index] = 1.0;
            (cumulative[index], grad)
        }
        SurvivalTarget::Event { index } => {
            let previous = if index == 0 { 0.0 } else { cumulative[index - 1] };
            let delta = (cumulative[index] - previous).max(MIN_INCREMENT);
            // -ln(1 - e^{-delta}) written with expm1 for small increments.
            let loss = previous - (-(-delta).exp_m1()).ln();
            let tail = 1.0 / delta.exp_m1();
            grad[index] = -tail;
            if index > 0 {
                grad[index - 1] = 1.0 + tail;
            }
            (loss, grad)
        }
    }
}
