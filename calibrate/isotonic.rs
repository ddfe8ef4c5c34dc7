//! Isotonic regression by pool-adjacent-violators with linear interpolation.

use crate::calibrate::CalibrationError;
use serde::{Deserialize, Serialize};

/// Which end of the fitted domain a score was clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClampSide {
    Below,
    Above,
}

/// A calibrated value and whether the raw score had to be clamped to get it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrated {
    pub value: f64,
    pub clamped: Option<ClampSide>,
}

/// Monotone non-decreasing piecewise-linear map from raw score to probability.
///
/// `thresholds` are strictly increasing raw scores, `values` the fitted probability
/// at each threshold. Scores between thresholds are linearly interpolated; scores
/// outside `[thresholds[0], thresholds[last]]` take the boundary value and are flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    pub thresholds: Vec<f64>,
    pub values: Vec<f64>,
}

impl IsotonicCalibrator {
    /// Fits the calibrator to `(score, outcome)` pairs.
    pub fn fit(scores: &[f64], outcomes: &[bool]) -> Result<Self, CalibrationError> {
        if scores.len() != outcomes.len() {
            return Err(CalibrationError::LengthMismatch {
                scores: scores.len(),
                outcomes: outcomes.len(),
            });
        }
        if scores.is_empty() {
            return Err(CalibrationError::NoData);
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(CalibrationError::NonFiniteScore);
        }

        let mut pairs: Vec<(f64, f64)> = scores
            .iter()
            .zip(outcomes)
            .map(|(&s, &o)| (s, if o { 1.0 } else { 0.0 }))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Identical scores form one starting block so the fit is a function of the score.
        let mut blocks: Vec<Block> = Vec::new();
        for (score, label) in pairs {
            match blocks.last_mut() {
                Some(last) if last.high == score => {
                    last.sum += label;
                    last.weight += 1.0;
                }
                _ => blocks.push(Block {
                    sum: label,
                    weight: 1.0,
                    low: score,
                    high: score,
                }),
            }
        }

        // Pool adjacent violators using a stack of merged blocks.
        let mut pooled: Vec<Block> = Vec::with_capacity(blocks.len());
        for block in blocks {
            pooled.push(block);
            while pooled.len() >= 2 {
                let n = pooled.len();
                if pooled[n - 2].mean() <= pooled[n - 1].mean() {
                    break;
                }
                if let Some(top) = pooled.pop() {
                    if let Some(below) = pooled.last_mut() {
                        below.sum += top.sum;
                        below.weight += top.weight;
                        below.high = top.high;
                    }
                }
            }
        }

        let mut thresholds = Vec::with_capacity(pooled.len() * 2);
        let mut values = Vec::with_capacity(pooled.len() * 2);
        for block in &pooled {
            let value = block.mean().clamp(0.0, 1.0);
            thresholds.push(block.low);
            values.push(value);
            if block.high > block.low {
                thresholds.push(block.high);
                values.push(value);
            }
        }
        Ok(Self { thresholds, values })
    }

    pub fn domain(&self) -> (f64, f64) {
        let low = self.thresholds.first().copied().unwrap_or(0.0);
        let high = self.thresholds.last().copied().unwrap_or(0.0);
        (low, high)
    }

    /// Maps one raw score. Non-finite scores are clamped to the low end.
    pub fn apply(&self, score: f64) -> Calibrated {
        let (Some(&first), Some(&last)) = (self.values.first(), self.values.last()) else {
            return Calibrated {
                value: score.clamp(0.0, 1.0),
                clamped: None,
            };
        };
        let (low, high) = self.domain();
        if !score.is_finite() || score < low {
            return Calibrated {
                value: first,
                clamped: Some(ClampSide::Below),
            };
        }
        if score > high {
            return Calibrated {
                value: last,
                clamped: Some(ClampSide::Above),
            };
        }
        // Index of the first threshold strictly above the score.
        let upper = self.thresholds.partition_point(|&t| t <= score);
        let value = if upper == 0 {
            first
        } else if upper >= self.thresholds.len() {
            last
        } else {
            let (x0, x1) = (self.thresholds[upper - 1], self.thresholds[upper]);
            let (y0, y1) = (self.values[upper - 1], self.values[upper]);
            y0 + (y1 - y0) * (score - x0) / (x1 - x0)
        };
        Calibrated {
            value,
            clamped: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    sum: f64,
    weight: f64,
    low: f64,
    high: f64,
}

impl Block {
    fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}
