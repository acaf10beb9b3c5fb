//! Explicit duration Viterbi parse
//!
//! State durations follow a shifted Poisson distribution truncated at the maximum state length,
//! where the final duration carries the survival probability of all longer durations. A segment
//! of the maximum length may follow a segment of the same state, so that longer runs can still be
//! represented.
//!

use statrs::distribution::{Discrete, DiscreteCDF, Poisson};

use super::{HiddenMarkovModel, get_diploid_state};
use crate::numeric_utils::max_index;

/// Expected durations are floored at this many bins
const MIN_DURATION_MEAN: f64 = 2.0;

/// Expected duration of state `state_index`, in bins
///
/// The diploid state is expected to persist much longer than the others.
///
fn get_duration_mean(state_index: usize, state_count: usize, max_state_length: usize) -> f64 {
    let divisor = if state_index == get_diploid_state(state_count) {
        2.0
    } else {
        10.0
    };
    (max_state_length as f64 / divisor).max(MIN_DURATION_MEAN)
}

/// Log probability of each state duration
///
/// Returns a table indexed [state][duration - 1] for durations `1..=max_state_length`.
///
pub fn calc_store_d(state_count: usize, max_state_length: usize) -> Vec<Vec<f64>> {
    assert!(max_state_length > 0);
    (0..state_count)
        .map(|state_index| {
            let mean = get_duration_mean(state_index, state_count, max_state_length);
            let mut durations = vec![f64::NEG_INFINITY; max_state_length];
            let Ok(pd) = Poisson::new(mean - 1.0) else {
                durations[0] = 0.0;
                return durations;
            };
            if max_state_length == 1 {
                durations[0] = 0.0;
                return durations;
            }
            for (duration_index, v) in durations.iter_mut().enumerate() {
                let k = duration_index as u64;
                *v = if duration_index + 1 < max_state_length {
                    pd.ln_pmf(k)
                } else {
                    pd.sf(k - 1).ln()
                };
            }
            durations
        })
        .collect()
}

impl HiddenMarkovModel {
    /// Log transition probabilities between distinct states, with self transitions removed and
    /// each row renormalized
    fn get_ln_switch_matrix(&self) -> Vec<Vec<f64>> {
        self.transition
            .iter()
            .enumerate()
            .map(|(from_index, row)| {
                let total = row
                    .iter()
                    .enumerate()
                    .filter(|(to_index, _)| *to_index != from_index)
                    .map(|(_, p)| p)
                    .sum::<f64>();
                row.iter()
                    .enumerate()
                    .map(|(to_index, p)| {
                        if to_index == from_index || total <= 0.0 {
                            f64::NEG_INFINITY
                        } else {
                            (p / total).ln()
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Most likely state path under the explicit duration model
    ///
    /// # Arguments
    /// * `observations` - Multi-sample observations indexed [bin][sample]
    /// * `max_state_length` - Longest single state duration, in bins
    ///
    pub fn best_hsmm_path_viterbi(
        &self,
        observations: &[Vec<f64>],
        max_state_length: usize,
    ) -> Vec<u8> {
        let obs_count = observations.len();
        if obs_count == 0 {
            return Vec::new();
        }

        let state_count = self.state_count();
        let max_state_length = max_state_length.max(1);
        let ln_emit = self.get_ln_emission_matrix(observations);
        let ln_duration = calc_store_d(state_count, max_state_length);
        let ln_switch = self.get_ln_switch_matrix();
        let ln_initial = self.initial.iter().map(|x| x.ln()).collect::<Vec<_>>();

        // Best score of any state path with a segment ending at each bin in each state
        let mut delta = vec![vec![f64::NEG_INFINITY; state_count]; obs_count];

        // Duration and previous state of the best segment ending at each bin in each state
        let mut back_pointer = vec![vec![(1usize, 0u8); state_count]; obs_count];

        // Best score and previous state for a new segment of each state starting after each bin
        let mut entry = vec![vec![(f64::NEG_INFINITY, 0u8); state_count]; obs_count];

        for obs_index in 0..obs_count {
            for state_index in 0..state_count {
                let mut max_lnprob = f64::NEG_INFINITY;
                let mut max_pointer = (1, state_index as u8);
                let mut emit_lnprob = 0.0;
                for duration in 1..=max_state_length.min(obs_index + 1) {
                    let seg_start = obs_index + 1 - duration;
                    emit_lnprob += ln_emit[seg_start][state_index];

                    let (entry_lnprob, prev_state) = if seg_start == 0 {
                        (ln_initial[state_index], state_index as u8)
                    } else {
                        let (mut lnprob, mut prev_state) = entry[seg_start - 1][state_index];
                        if duration == max_state_length
                            && delta[seg_start - 1][state_index] > lnprob
                        {
                            lnprob = delta[seg_start - 1][state_index];
                            prev_state = state_index as u8;
                        }
                        (lnprob, prev_state)
                    };

                    let lnprob =
                        entry_lnprob + ln_duration[state_index][duration - 1] + emit_lnprob;
                    if lnprob > max_lnprob {
                        max_lnprob = lnprob;
                        max_pointer = (duration, prev_state);
                    }
                }
                delta[obs_index][state_index] = max_lnprob;
                back_pointer[obs_index][state_index] = max_pointer;
            }

            for to_index in 0..state_count {
                let mut best = (f64::NEG_INFINITY, 0u8);
                for from_index in 0..state_count {
                    let lnprob = delta[obs_index][from_index] + ln_switch[from_index][to_index];
                    if lnprob > best.0 {
                        best = (lnprob, from_index as u8);
                    }
                }
                entry[obs_index][to_index] = best;
            }
        }

        let mut max_path = vec![0u8; obs_count];
        let mut seg_end = obs_count - 1;
        let mut state_index = max_index(&delta[seg_end]);
        loop {
            let (duration, prev_state) = back_pointer[seg_end][state_index];
            let seg_start = seg_end + 1 - duration;
            max_path[seg_start..=seg_end].fill(state_index as u8);
            if seg_start == 0 {
                break;
            }
            seg_end = seg_start - 1;
            state_index = prev_state as usize;
        }
        max_path
    }
}
