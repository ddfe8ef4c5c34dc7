//! Discrimination metrics on risk curves: per-horizon AUC and Harrell's C-index.

use crate::types::{OutcomeLabel, RiskCurve};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Area under the ROC curve via the Mann-Whitney U statistic, with tied scores
/// receiving their average rank. `None` when either class is empty.
pub fn auc(scores: &[f64], outcomes: &[bool]) -> Option<f64> {
    let n = scores.len().min(outcomes.len());
    let positives = outcomes[..n].iter().filter(|o| **o).count() as f64;
    let negatives = n as f64 - positives;
    if positives == 0.0 || negatives == 0.0 {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| scores[i].partial_cmp(&scores[j]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && scores[order[j]] == scores[order[i]] {
            j += 1;
        }
        let average_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &index in &order[i..j] {
            ranks[index] = average_rank;
        }
        i = j;
    }

    let positive_rank_sum: f64 = (0..n).filter(|&k| outcomes[k]).map(|k| ranks[k]).sum();
    Some((positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonAuc {
    /// One-based year, as reported to users.
    pub year: usize,
    pub auc: Option<f64>,
    pub positives: usize,
    pub negatives: usize,
}

/// AUC of the risk at each horizon against the binary outcome at that horizon.
///
/// Positives were diagnosed by the horizon; negatives were followed cancer-free past
/// it. Exams that are neither are left out of that horizon.
pub fn per_horizon_auc(curves: &[RiskCurve], labels: &[OutcomeLabel], horizons: usize) -> Vec<HorizonAuc> {
    (0..horizons)
        .map(|index| {
            let mut scores = Vec::new();
            let mut outcomes = Vec::new();
            for (curve, label) in curves.iter().zip(labels) {
                if let (Some(outcome), Some(score)) = (label.outcome_at(index, horizons), curve.at(index)) {
                    scores.push(score);
                    outcomes.push(outcome);
                }
            }
            let positives = outcomes.iter().filter(|o| **o).count();
            HorizonAuc {
                year: index + 1,
                auc: auc(&scores, &outcomes),
                positives,
                negatives: outcomes.len() - positives,
            }
        })
        .collect()
}

/// Observed time in years and event flag of one label, truncated at the horizon. A
/// diagnosis at horizon index `e` happened by year `e + 1`; otherwise the time is the
/// number of years the exam is known to be cancer-free.
fn observed_time(label: &OutcomeLabel, horizons: usize) -> (usize, bool) {
    match label.event_index(horizons) {
        Some(event) => (event + 1, true),
        None => {
            let followup = label.years_to_last_followup as usize;
            let free_through = if label.is_censored() {
                followup
            } else {
                followup.min(label.years_to_cancer as usize)
            };
            (free_through.min(horizons), false)
        }
    }
}

/// Harrell's concordance index over exams, ranking by the final-horizon risk.
///
/// A pair is comparable when one exam has an in-window event before the other
/// exam's observed time, or in the same year as the other exam's censoring (the
/// censored exam was still at risk then). Tied risks count as half-concordant.
/// `None` when no pair is comparable.
pub fn concordance_index(curves: &[RiskCurve], labels: &[OutcomeLabel], horizons: usize) -> Option<f64> {
    let observations: Vec<(usize, bool, f64)> = curves
        .iter()
        .zip(labels)
        .map(|(curve, label)| {
            let (time, event) = observed_time(label, horizons);
            (time, event, curve.last())
        })
        .collect();

    let mut concordant = 0.0;
    let mut comparable = 0usize;
    for (i, &(time_i, event_i, risk_i)) in observations.iter().enumerate() {
        if !event_i {
            continue;
        }
        for (j, &(time_j, event_j, risk_j)) in observations.iter().enumerate() {
            if i == j || time_i > time_j || (time_i == time_j && event_j) {
                continue;
            }
            comparable += 1;
            match risk_i.partial_cmp(&risk_j) {
                Some(Ordering::Greater) => concordant += 1.0,
                Some(Ordering::Equal) => concordant += 0.5,
                _ => {}
            }
        }
    }
    (comparable > 0).then(|| concordant / comparable as f64)
}
