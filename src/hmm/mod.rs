//! Hidden Markov model copy number segmentation
//!
//! Each hidden state represents one copy number level, and emits a multi-sample observation for
//! each bin. Model parameters are initialized from the haploid level of each sample, optionally
//! re-estimated with Baum-Welch, and the state path is decoded with either a standard Viterbi
//! parse or an explicit duration (semi-Markov) Viterbi parse.
//!

mod emission;
mod hsmm;

pub use self::emission::{EmissionDistribution, EmissionKind};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::numeric_utils::{
    MAD_NORMAL_SCALE, max_index, median_absolute_deviation, median_all, weighted_average,
    weighted_sum_of_squares,
};

/// Probability of staying in the same state between adjacent bins
const SELF_TRANSITION_PROB: f64 = 0.99;

/// Haploid level multipliers used to initialize the state means
const INIT_COPY_NUMBER_FACTORS: [f64; 5] = [0.1, 1.0, 2.0, 3.0, 4.0];

const MAX_BAUM_WELCH_ITERATIONS: usize = 4;

/// Baum-Welch stops when the log likelihood changes by less than this
const LIKELIHOOD_CONVERGENCE_THRESHOLD: f64 = 0.01;

/// Parameter re-estimation is skipped for larger sample counts
const MAX_BAUM_WELCH_SAMPLES: usize = 3;

/// Emission parameters are only re-estimated for states with at least this much summed
/// posterior weight, in bins
const MIN_STATE_SUPPORT: f64 = 1.0;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HmmDecoder {
    #[default]
    Viterbi,
    Hsmm,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HmmParameters {
    pub hidden_states: usize,
    pub emission: EmissionKind,
    pub decoder: HmmDecoder,

    /// Longest state duration modeled by the semi-Markov decoder, in bins
    pub max_state_length: usize,

    /// Chromosomes with no more than this many bins are not segmented
    pub min_size: usize,
}

impl Default for HmmParameters {
    fn default() -> Self {
        Self {
            hidden_states: 5,
            emission: EmissionKind::Gaussian,
            decoder: HmmDecoder::Viterbi,
            max_state_length: 100,
            min_size: 10,
        }
    }
}

/// Index of the state initialized to the diploid level
fn get_diploid_state(state_count: usize) -> usize {
    2.min(state_count - 1)
}

/// Multiplier of the haploid level used to initialize the mean of each state
///
/// For fewer than five states the last state is raised to the state count so that the model can
/// still represent gains.
///
fn get_state_copy_number_factors(state_count: usize) -> Vec<f64> {
    let mut factors = (0..state_count)
        .map(|s| INIT_COPY_NUMBER_FACTORS.get(s).copied().unwrap_or(s as f64))
        .collect::<Vec<_>>();
    if state_count < INIT_COPY_NUMBER_FACTORS.len() {
        factors[state_count - 1] = state_count as f64;
    }
    factors
}

/// Extract each sample's values as a separate vector
fn get_sample_columns(observations: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let sample_count = observations.first().map_or(0, |x| x.len());
    (0..sample_count)
        .map(|sample_index| observations.iter().map(|x| x[sample_index]).collect())
        .collect()
}

/// Scale `row` to sum to one, returning the sum before scaling
///
/// A row which can't be normalized is replaced with certainty in `fallback_state`.
///
fn normalize_row(row: &mut [f64], fallback_state: usize) -> f64 {
    let sum = row.iter().sum::<f64>();
    if sum > 0.0 && sum.is_finite() {
        for v in row.iter_mut() {
            *v /= sum;
        }
    } else {
        row.fill(0.0);
        row[fallback_state] = 1.0;
    }
    sum
}

/// Posterior state statistics from one forward-backward pass
struct PosteriorStats {
    /// Per-bin state posteriors, indexed [bin][state]
    gamma: Vec<Vec<f64>>,

    /// Pairwise state posteriors summed over all adjacent bin pairs, indexed [from][to]
    epsilon_sum: Vec<Vec<f64>>,
}

pub struct HiddenMarkovModel {
    emissions: Vec<EmissionDistribution>,

    /// Transition probabilities indexed [from][to]
    transition: Vec<Vec<f64>>,

    initial: Vec<f64>,
}

impl HiddenMarkovModel {
    /// Initialize the model from multi-sample observations, indexed [bin][sample]
    ///
    /// Observations above the highest state level of each sample are clamped to that level in
    /// place before the model is initialized.
    ///
    pub fn new(observations: &mut [Vec<f64>], state_count: usize, kind: EmissionKind) -> Self {
        assert!(state_count >= 2);
        assert!(!observations.is_empty());

        let mut columns = get_sample_columns(observations);
        let haploid_means = columns
            .iter()
            .map(|x| median_all(x) / 2.0)
            .collect::<Vec<_>>();

        for (sample_index, &haploid_mean) in haploid_means.iter().enumerate() {
            let max_value = haploid_mean * state_count as f64;
            for obs in observations.iter_mut() {
                if obs[sample_index] > max_value {
                    obs[sample_index] = max_value;
                }
            }
            for v in columns[sample_index].iter_mut() {
                if *v > max_value {
                    *v = max_value;
                }
            }
        }

        let mads = columns
            .iter()
            .map(|x| median_absolute_deviation(x, MAD_NORMAL_SCALE))
            .collect::<Vec<_>>();

        let emissions = get_state_copy_number_factors(state_count)
            .into_iter()
            .map(|factor| {
                let mean = haploid_means.iter().map(|h| h * factor).collect();
                let variance = mads
                    .iter()
                    .map(|mad| mad * mad * factor.max(0.1) / 2.0)
                    .collect();
                EmissionDistribution::new(kind, mean, variance)
            })
            .collect();

        Self::from_emissions(emissions)
    }

    /// Create a model with the standard transition matrix and uniform initial state distribution
    pub fn from_emissions(emissions: Vec<EmissionDistribution>) -> Self {
        let state_count = emissions.len();
        assert!(state_count >= 2);
        let change_prob = (1.0 - SELF_TRANSITION_PROB) / (state_count - 1) as f64;
        let transition = (0..state_count)
            .map(|from_index| {
                (0..state_count)
                    .map(|to_index| {
                        if from_index == to_index {
                            SELF_TRANSITION_PROB
                        } else {
                            change_prob
                        }
                    })
                    .collect()
            })
            .collect();
        let initial = vec![1.0 / state_count as f64; state_count];
        Self {
            emissions,
            transition,
            initial,
        }
    }

    pub fn state_count(&self) -> usize {
        self.emissions.len()
    }

    pub fn emissions(&self) -> &[EmissionDistribution] {
        &self.emissions
    }

    /// Emission likelihoods indexed [bin][state]
    fn get_emission_matrix(&self, observations: &[Vec<f64>]) -> Vec<Vec<f64>> {
        observations
            .iter()
            .map(|obs| {
                self.emissions
                    .iter()
                    .map(|e| e.estimate_likelihood(obs))
                    .collect()
            })
            .collect()
    }

    /// Log emission likelihoods indexed [bin][state]
    fn get_ln_emission_matrix(&self, observations: &[Vec<f64>]) -> Vec<Vec<f64>> {
        observations
            .iter()
            .map(|obs| self.emissions.iter().map(|e| e.ln_likelihood(obs)).collect())
            .collect()
    }

    /// Scaled forward recursion
    ///
    /// Returns the per-bin normalized forward probabilities and the log likelihood of the
    /// observations.
    ///
    fn forward(&self, emit: &[Vec<f64>]) -> (Vec<Vec<f64>>, f64) {
        let state_count = self.state_count();
        let fallback_state = get_diploid_state(state_count);
        let mut alpha = vec![vec![0.0; state_count]; emit.len()];
        let mut loglik = 0.0;

        for bin_index in 0..emit.len() {
            for to_index in 0..state_count {
                let prior = if bin_index == 0 {
                    self.initial[to_index]
                } else {
                    let last_row = &alpha[bin_index - 1];
                    (0..state_count)
                        .map(|from_index| last_row[from_index] * self.transition[from_index][to_index])
                        .sum()
                };
                alpha[bin_index][to_index] = prior * emit[bin_index][to_index];
            }
            let scale = normalize_row(&mut alpha[bin_index], fallback_state);
            if scale > 0.0 {
                loglik += scale.ln();
            }
        }
        (alpha, loglik)
    }

    /// Scaled backward recursion
    ///
    /// Each row is normalized independently of the forward pass, so both passes can run
    /// concurrently. Row scaling cancels in the normalized posteriors.
    ///
    fn backward(&self, emit: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let state_count = self.state_count();
        let fallback_state = get_diploid_state(state_count);
        let bin_count = emit.len();
        let mut beta = vec![vec![1.0 / state_count as f64; state_count]; bin_count];

        for bin_index in (0..bin_count.saturating_sub(1)).rev() {
            for from_index in 0..state_count {
                let next_row = &beta[bin_index + 1];
                beta[bin_index][from_index] = (0..state_count)
                    .map(|to_index| {
                        self.transition[from_index][to_index]
                            * emit[bin_index + 1][to_index]
                            * next_row[to_index]
                    })
                    .sum();
            }
            normalize_row(&mut beta[bin_index], fallback_state);
        }
        beta
    }

    /// Compute posterior state marginals and summed pairwise posteriors
    fn expectation(&self, emit: &[Vec<f64>], alpha: &[Vec<f64>], beta: &[Vec<f64>]) -> PosteriorStats {
        let state_count = self.state_count();
        let fallback_state = get_diploid_state(state_count);

        let gamma = alpha
            .iter()
            .zip(beta)
            .map(|(a, b)| {
                let mut row = a.iter().zip(b).map(|(x, y)| x * y).collect::<Vec<_>>();
                normalize_row(&mut row, fallback_state);
                row
            })
            .collect();

        let mut epsilon_sum = vec![vec![0.0; state_count]; state_count];
        let mut epsilon = vec![vec![0.0; state_count]; state_count];
        for bin_index in 0..alpha.len().saturating_sub(1) {
            let mut total = 0.0;
            for from_index in 0..state_count {
                for to_index in 0..state_count {
                    let v = alpha[bin_index][from_index]
                        * self.transition[from_index][to_index]
                        * emit[bin_index + 1][to_index]
                        * beta[bin_index + 1][to_index];
                    epsilon[from_index][to_index] = v;
                    total += v;
                }
            }
            if !(total > 0.0 && total.is_finite()) {
                continue;
            }
            for (sum_row, row) in epsilon_sum.iter_mut().zip(epsilon.iter()) {
                for (s, v) in sum_row.iter_mut().zip(row) {
                    *s += v / total;
                }
            }
        }

        PosteriorStats { gamma, epsilon_sum }
    }

    /// Re-estimate transitions and emission parameters from posterior statistics
    ///
    /// Transition rows without posterior support keep their current values. States with less than
    /// `MIN_STATE_SUPPORT` bins of summed posterior weight keep their current emission parameters,
    /// so that a state is not fit to the few bins where its weight happens to be largest.
    ///
    fn maximization(&mut self, columns: &[Vec<f64>], stats: &PosteriorStats) {
        for (row, epsilon_row) in self.transition.iter_mut().zip(stats.epsilon_sum.iter()) {
            let total = epsilon_row.iter().sum::<f64>();
            if total > 0.0 {
                for (t, e) in row.iter_mut().zip(epsilon_row) {
                    *t = e / total;
                }
            }
        }

        for (state_index, emission) in self.emissions.iter_mut().enumerate() {
            let weights = stats
                .gamma
                .iter()
                .map(|g| g[state_index])
                .collect::<Vec<_>>();
            let total = weights.iter().sum::<f64>();
            if !(total >= MIN_STATE_SUPPORT) {
                continue;
            }

            let mut mean = Vec::with_capacity(columns.len());
            let mut variance = Vec::with_capacity(columns.len());
            for column in columns {
                let m = weighted_average(column, Some(weights.as_slice()));
                variance.push(weighted_sum_of_squares(column, Some(weights.as_slice()), m) / total);
                mean.push(m);
            }
            emission.update(mean, variance);
        }
    }

    /// Re-estimate model parameters with the Baum-Welch algorithm
    ///
    /// Returns the log likelihood computed in each iteration
    ///
    pub fn baum_welch(&mut self, observations: &[Vec<f64>]) -> Vec<f64> {
        let columns = get_sample_columns(observations);
        let mut history: Vec<f64> = Vec::new();
        for _ in 0..MAX_BAUM_WELCH_ITERATIONS {
            let emit = self.get_emission_matrix(observations);
            let ((alpha, loglik), beta) =
                rayon::join(|| self.forward(&emit), || self.backward(&emit));

            let converged = history
                .last()
                .is_some_and(|&last| (loglik - last).abs() < LIKELIHOOD_CONVERGENCE_THRESHOLD);
            history.push(loglik);
            if converged {
                break;
            }

            let stats = self.expectation(&emit, &alpha, &beta);
            self.maximization(&columns, &stats);
        }
        history
    }

    /// Most likely state path, by a Viterbi parse in log space
    pub fn best_path_viterbi(&self, observations: &[Vec<f64>]) -> Vec<u8> {
        let obs_count = observations.len();
        if obs_count == 0 {
            return Vec::new();
        }

        let state_count = self.state_count();
        let ln_emit = self.get_ln_emission_matrix(observations);
        let ln_transition = self
            .transition
            .iter()
            .map(|row| row.iter().map(|x| x.ln()).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        // Instead of having a full SxO DP matrix, just ping-pong on two rows
        let mut max_pr_row1 = self
            .initial
            .iter()
            .zip(ln_emit[0].iter())
            .map(|(init, emit)| init.ln() + emit)
            .collect::<Vec<_>>();
        let mut max_pr_row2 = vec![0.0; state_count];

        let mut back_pointer = vec![vec![0u8; state_count]; obs_count];

        let this_row = &mut max_pr_row1;
        let last_row = &mut max_pr_row2;
        for obs_index in 1..obs_count {
            std::mem::swap(this_row, last_row);
            for (to_state_index, row_value) in this_row.iter_mut().enumerate() {
                let emit_lnprob = ln_emit[obs_index][to_state_index];

                let mut max_index = 0;
                let mut max_lnprob = 0.0;
                for from_state_index in 0..state_count {
                    let lnprob = last_row[from_state_index]
                        + ln_transition[from_state_index][to_state_index]
                        + emit_lnprob;

                    if (from_state_index == 0) || (lnprob > max_lnprob) {
                        max_index = from_state_index;
                        max_lnprob = lnprob;
                    }
                }

                *row_value = max_lnprob;
                back_pointer[obs_index][to_state_index] = max_index as u8;
            }
        }

        get_backtrace(this_row, &back_pointer)
    }
}

/// Backtrace to get viterbi parse
fn get_backtrace(last_row: &[f64], back_pointer: &[Vec<u8>]) -> Vec<u8> {
    let mut max_state = max_index(last_row);

    let obs_count = back_pointer.len();
    let mut max_path: Vec<u8> = vec![0; obs_count];
    for obs_index in (0..obs_count).rev() {
        max_path[obs_index] = max_state as u8;
        max_state = back_pointer[obs_index][max_state] as usize;
    }
    max_path
}

/// Index of every bin where the decoded state differs from the previous bin
fn get_state_change_breakpoints(path: &[u8]) -> Vec<usize> {
    (1..path.len()).filter(|&i| path[i] != path[i - 1]).collect()
}

/// Segment one chromosome of multi-sample observations, indexed [bin][sample]
///
/// Returns the index of the first bin of every segment after the first
///
pub fn hmm_segment(observations: &[Vec<f64>], params: &HmmParameters) -> Vec<usize> {
    let bin_count = observations.len();
    if bin_count <= params.min_size || bin_count < 2 {
        return Vec::new();
    }
    let sample_count = observations[0].len();

    let mut observations = observations.to_vec();
    let mut model = HiddenMarkovModel::new(&mut observations, params.hidden_states, params.emission);

    if sample_count <= MAX_BAUM_WELCH_SAMPLES {
        let history = model.baum_welch(&observations);
        debug!(
            "Baum-Welch log likelihood over {} iterations: {:?}",
            history.len(),
            history
        );
    }
    debug!(
        "HMM state means: {:?}",
        model.emissions().iter().map(|e| e.mean()).collect::<Vec<_>>()
    );

    let path = match params.decoder {
        HmmDecoder::Viterbi => model.best_path_viterbi(&observations),
        HmmDecoder::Hsmm => model.best_hsmm_path_viterbi(&observations, params.max_state_length),
    };
    get_state_change_breakpoints(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single sample with alternating +/-1 noise at levels 20 and 60
    fn get_step_observations() -> Vec<Vec<f64>> {
        (0..80)
            .map(|i| {
                let level = if i < 40 { 20.0 } else { 60.0 };
                vec![level + if i % 2 == 0 { 1.0 } else { -1.0 }]
            })
            .collect()
    }

    fn get_test_model() -> HiddenMarkovModel {
        let emissions = [0.0, 10.0, 20.0, 30.0, 40.0]
            .iter()
            .map(|&m| EmissionDistribution::new(EmissionKind::Gaussian, vec![m], vec![1.0]))
            .collect();
        HiddenMarkovModel::from_emissions(emissions)
    }

    #[test]
    fn test_copy_number_factors() {
        assert_eq!(get_state_copy_number_factors(5), vec![0.1, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(get_state_copy_number_factors(7), vec![0.1, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(get_state_copy_number_factors(3), vec![0.1, 1.0, 3.0]);
        assert_eq!(get_diploid_state(5), 2);
        assert_eq!(get_diploid_state(2), 1);
    }

    #[test]
    fn test_init_clamps_outliers() {
        let mut observations = (0..20).map(|_| vec![20.0]).collect::<Vec<_>>();
        observations[3][0] = 1000.0;
        let model = HiddenMarkovModel::new(&mut observations, 5, EmissionKind::Gaussian);
        assert_eq!(observations[3][0], 50.0);
        approx::assert_ulps_eq!(model.emissions()[2].mean()[0], 20.0, max_ulps = 4);
        approx::assert_ulps_eq!(model.emissions()[0].mean()[0], 1.0, max_ulps = 4);
    }

    #[test]
    fn test_forward_backward_consistency() {
        let model = get_test_model();
        let observations = [10.2, 9.5, 10.9, 30.1, 29.4, 31.0]
            .iter()
            .map(|&x| vec![x])
            .collect::<Vec<_>>();
        let emit = model.get_emission_matrix(&observations);
        let (alpha, loglik) = model.forward(&emit);
        let beta = model.backward(&emit);
        assert!(loglik.is_finite());

        for row in alpha.iter().chain(beta.iter()) {
            approx::assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }

        let stats = model.expectation(&emit, &alpha, &beta);
        assert_eq!(max_index(&stats.gamma[0]), 1);
        assert_eq!(max_index(&stats.gamma[5]), 3);
        let epsilon_total = stats.epsilon_sum.iter().flatten().sum::<f64>();
        approx::assert_abs_diff_eq!(epsilon_total, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_collapse_fallback() {
        let model = get_test_model();
        let emit = vec![vec![0.0; 5]; 3];
        let (alpha, loglik) = model.forward(&emit);
        assert_eq!(alpha[1], vec![0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(loglik, 0.0);
    }

    #[test]
    fn test_baum_welch_monotonic_likelihood() {
        let mut observations = get_step_observations();
        let mut model = HiddenMarkovModel::new(&mut observations, 5, EmissionKind::Gaussian);
        let history = model.baum_welch(&observations);
        assert!(!history.is_empty() && history.len() <= MAX_BAUM_WELCH_ITERATIONS);
        for w in history.windows(2) {
            assert!(w[1] >= w[0] - 1e-8, "{history:?}");
        }
    }

    #[test]
    fn test_baum_welch_keeps_unsupported_states() {
        let mut observations = get_step_observations();
        let mut model = HiddenMarkovModel::new(&mut observations, 5, EmissionKind::Gaussian);
        let initial_mean = model.emissions()[0].mean()[0];
        model.baum_welch(&observations);

        // The lowest state has almost no posterior weight on a 20/60 step, so it keeps its
        // initial level instead of collapsing onto the first bin
        approx::assert_ulps_eq!(model.emissions()[0].mean()[0], initial_mean, max_ulps = 4);

        let path = model.best_path_viterbi(&observations);
        assert!(path[..40].iter().all(|&s| s == path[0]), "{path:?}");
        assert!(path[40..].iter().all(|&s| s == path[40]), "{path:?}");
        let low_mean = model.emissions()[path[0] as usize].mean()[0];
        let high_mean = model.emissions()[path[40] as usize].mean()[0];
        approx::assert_abs_diff_eq!(low_mean, 20.0, epsilon = 0.5);
        approx::assert_abs_diff_eq!(high_mean, 60.0, epsilon = 0.5);
    }

    #[test]
    fn test_viterbi() {
        let model = get_test_model();
        let observations = [10.2, 9.5, 10.9, 30.1, 29.4, 31.0, 0.5]
            .iter()
            .map(|&x| vec![x])
            .collect::<Vec<_>>();
        let path = model.best_path_viterbi(&observations);
        assert_eq!(path, vec![1, 1, 1, 3, 3, 3, 0]);
        assert_eq!(get_state_change_breakpoints(&path), vec![3, 6]);
        assert!(model.best_path_viterbi(&[]).is_empty());
    }

    #[test]
    fn test_hmm_segment() {
        let observations = get_step_observations();
        let params = HmmParameters::default();
        assert_eq!(hmm_segment(&observations, &params), vec![40]);

        let params = HmmParameters {
            emission: EmissionKind::Poisson,
            ..Default::default()
        };
        assert_eq!(hmm_segment(&observations, &params), vec![40]);

        // Short chromosomes are not segmented
        assert!(hmm_segment(&observations[..10], &HmmParameters::default()).is_empty());
    }

    #[test]
    fn test_hmm_segment_multi_sample() {
        // Four samples skip re-estimation, and share the same step
        let observations = get_step_observations()
            .into_iter()
            .map(|x| vec![x[0]; 4])
            .collect::<Vec<_>>();
        let params = HmmParameters::default();
        assert_eq!(hmm_segment(&observations, &params), vec![40]);
    }
}
