//! Hyperparameter sweep: a grid of isolated candidate runs spread over a fixed pool
//! of execution slots, with selection by development C-index.

use crate::config::{StageConfig, SweepConfig};
use crate::train::TrainError;
use crate::train::observer::TrainingStage;
use itertools::iproduct;
use rayon::prelude::*;

/// One point of the sweep grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub slot: usize,
    pub stage: StageConfig,
}

/// Anything a candidate run produces that can be ranked.
pub trait Scored {
    fn dev_c_index(&self) -> Option<f64>;
}

/// Expands the learning-rate × weight-decay grid over `base`. An empty list keeps the
/// base value for that axis.
pub fn candidates(base: &StageConfig, sweep: &SweepConfig) -> Vec<Candidate> {
    let rates = if sweep.learning_rates.is_empty() {
        vec![base.learning_rate]
    } else {
        sweep.learning_rates.clone()
    };
    let decays = if sweep.weight_decays.is_empty() {
        vec![base.weight_decay]
    } else {
        sweep.weight_decays.clone()
    };
    let slots = sweep.device_slots.max(1);
    iproduct!(rates, decays)
        .enumerate()
        .map(|(index, (learning_rate, weight_decay))| Candidate {
            index,
            slot: index % slots,
            stage: StageConfig {
                learning_rate,
                weight_decay,
                ..base.clone()
            },
        })
        .collect()
}

/// Runs every candidate and returns the best successful one.
///
/// Slots run in parallel; candidates sharing a slot run one after another. A failed
/// candidate is logged and excluded. Ties on C-index go to the earlier candidate, and
/// a run without a defined C-index ranks below any run with one.
pub fn run_sweep<T, F>(stage: TrainingStage, candidates: Vec<Candidate>, run: F) -> Result<(Candidate, T), TrainError>
where
    T: Scored + Send,
    F: Fn(&Candidate) -> Result<T, TrainError> + Sync,
{
    let slots = candidates.iter().map(|c| c.slot + 1).max().unwrap_or(0);
    let mut queues: Vec<Vec<Candidate>> = vec![Vec::new(); slots];
    for candidate in candidates {
        queues[candidate.slot].push(candidate);
    }

    let mut finished: Vec<(Candidate, T)> = queues
        .into_par_iter()
        .flat_map_iter(|queue| {
            queue
                .into_iter()
                .filter_map(|candidate| match run(&candidate) {
                    Ok(outcome) => Some((candidate, outcome)),
                    Err(e) => {
                        log::warn!(
                            "{stage}: candidate {} (lr {}, weight decay {}) excluded: {e}",
                            candidate.index,
                            candidate.stage.learning_rate,
                            candidate.stage.weight_decay
                        );
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect();
    finished.sort_by_key(|(candidate, _)| candidate.index);

    let mut best: Option<(Candidate, T)> = None;
    for (candidate, outcome) in finished {
        let better = match &best {
            None => true,
            Some((_, current)) => match (outcome.dev_c_index(), current.dev_c_index()) {
                (Some(c), Some(b)) => c > b,
                (Some(_), None) => true,
                _ => false,
            },
        };
        if better {
            best = Some((candidate, outcome));
        }
    }
    let (candidate, outcome) = best.ok_or(TrainError::NoCandidates { stage })?;
    log::info!(
        "{stage}: selected candidate {} (lr {}, weight decay {}) with dev C-index {:?}.",
        candidate.index,
        candidate.stage.learning_rate,
        candidate.stage.weight_decay,
        outcome.dev_c_index()
    );
    Ok((candidate, outcome))
}
