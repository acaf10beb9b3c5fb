//! Circular binary segmentation
//!
//! Segments are split recursively, depth first, by testing the maximal circular t-statistic of
//! each pending segment with a permutation test. Each chromosome uses its own seeded random
//! stream so that results do not depend on thread scheduling.
//!

mod boundary;
mod changepoint_stats;
mod undo;

use log::info;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use simple_error::{SimpleResult, bail};

use self::boundary::compute_boundary;
use self::changepoint_stats::find_change_points;
use self::undo::{change_points_prune, change_points_sd_undo};
use crate::numeric_utils::{mean, trimmed_variance};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UndoMethod {
    #[default]
    None,
    Prune,
    #[value(name = "sdundo")]
    SdUndo,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CbsParameters {
    /// Significance level of the permutation test
    pub alpha: f64,
    pub nperm: usize,

    /// Minimum segment length in bins
    pub min_width: usize,

    /// Maximum arc length for the hybrid permutation statistic
    pub kmax: usize,

    /// Segments longer than this use the hybrid p-value computation
    pub nmin: usize,

    /// Type I error rate of the sequential stopping boundary
    pub eta: f64,

    pub undo_method: UndoMethod,

    /// Relative residual sum of squares increase allowed by prune undo
    pub undo_prune: f64,

    /// Number of trimmed standard deviations between segment medians required by sd undo
    pub undo_sd: f64,

    /// Fraction trimmed from each tail for the trimmed standard deviation
    pub trim: f64,
}

impl Default for CbsParameters {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            nperm: 10000,
            min_width: 2,
            kmax: 25,
            nmin: 200,
            eta: 0.05,
            undo_method: UndoMethod::None,
            undo_prune: 0.05,
            undo_sd: 3.0,
            trim: 0.025,
        }
    }
}

impl CbsParameters {
    /// Number of rows needed in the sequential boundary table
    pub fn max_ones(&self) -> usize {
        (self.nperm as f64 * self.alpha).floor() as usize + 1
    }
}

/// Check CBS parameter preconditions
///
/// Assumes no logger has been configured yet
///
pub fn validate_cbs_parameters(params: &CbsParameters) -> SimpleResult<()> {
    if !(2..=5).contains(&params.min_width) {
        bail!(
            "--min-width must be in the range [2,5], found {}",
            params.min_width
        );
    }
    if params.kmax == 0 {
        bail!("--kmax must be greater than 0");
    }
    if params.nmin < 4 * params.kmax {
        bail!(
            "--nmin ({}) must be at least 4 times --kmax ({})",
            params.nmin,
            params.kmax
        );
    }
    if params.nperm == 0 {
        bail!("--nperm must be greater than 0");
    }
    if !(params.alpha > 0.0 && params.alpha < 1.0) {
        bail!("--alpha must be in the range (0,1), found {}", params.alpha);
    }
    if !(params.eta > 0.0 && params.eta < 1.0) {
        bail!("--eta must be in the range (0,1), found {}", params.eta);
    }
    if params.undo_prune < 0.0 {
        bail!("--undo-prune must be non-negative");
    }
    if params.undo_sd < 0.0 {
        bail!("--undo-sd must be non-negative");
    }
    Ok(())
}

/// Split `x` into segments, returning the end position of each segment
///
/// The final end position is always `x.len()`, unless `x` is empty.
///
pub fn change_points<R: Rng>(
    x: &[f64],
    params: &CbsParameters,
    sbdry: &[usize],
    rng: &mut R,
) -> Vec<usize> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }

    let mut seg_end = vec![0, n];
    let mut change_loc = Vec::new();
    while seg_end.len() > 1 {
        let k = seg_end.len() - 1;
        let seg_start = seg_end[k - 1];
        let current = &x[seg_start..seg_end[k]];
        let current_n = current.len();

        let cpts = if current_n >= 2 * params.min_width {
            let current_mean = mean(current);
            let centered = current.iter().map(|v| v - current_mean).collect::<Vec<_>>();
            let tss = centered.iter().map(|v| v * v).sum::<f64>();
            let hybrid = params.nmin < current_n;
            let delta = (params.kmax + 1) as f64 / current_n as f64;
            find_change_points(&centered, tss, params, sbdry, hybrid, delta, rng).change_points()
        } else {
            Vec::new()
        };

        if cpts.is_empty() {
            change_loc.push(seg_end[k]);
            seg_end.pop();
        } else {
            for (offset, cpt) in cpts.into_iter().enumerate() {
                seg_end.insert(k + offset, seg_start + cpt);
            }
        }
    }

    change_loc.reverse();
    change_loc
}

/// Shared CBS state for all chromosomes in one run
pub struct CbsSegmenter {
    params: CbsParameters,
    sbdry: Vec<usize>,
}

impl CbsSegmenter {
    pub fn new(params: &CbsParameters) -> Self {
        info!(
            "Computing CBS sequential boundary for {} permutations",
            params.nperm
        );
        let sbdry = compute_boundary(params.nperm, params.max_ones(), params.eta);
        Self {
            params: params.clone(),
            sbdry,
        }
    }

    /// Segment one chromosome and return segment end positions
    pub fn segment_ends(&self, x: &[f64], seed: u64) -> Vec<usize> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let seg_ends = change_points(x, &self.params, &self.sbdry, &mut rng);
        match self.params.undo_method {
            UndoMethod::None => seg_ends,
            UndoMethod::Prune => change_points_prune(x, &seg_ends, self.params.undo_prune),
            UndoMethod::SdUndo => {
                let trimmed_sd = trimmed_variance(x, self.params.trim).sqrt();
                change_points_sd_undo(x, &seg_ends, trimmed_sd, self.params.undo_sd)
            }
        }
    }

    /// Segment one chromosome and return the index of the first bin of every segment after the
    /// first
    pub fn breakpoints(&self, x: &[f64], seed: u64) -> Vec<usize> {
        let mut seg_ends = self.segment_ends(x, seed);
        seg_ends.pop();
        seg_ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn get_test_params() -> CbsParameters {
        CbsParameters {
            nperm: 1000,
            ..Default::default()
        }
    }

    /// Deterministic uniform noise in [-0.5, 0.5), from a splitmix64 hash of `i`
    pub(super) fn get_hashed_noise(i: u64) -> f64 {
        let mut z = i.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64 - 0.5
    }

    /// Noisy signal with a shift of `step` starting at bin `step_pos`
    pub(super) fn get_noisy_step(len: usize, step_pos: usize, step: f64, offset: u64) -> Vec<f64> {
        (0..len)
            .map(|i| get_hashed_noise(i as u64 + offset) + if i >= step_pos { step } else { 0.0 })
            .collect()
    }

    #[test]
    fn test_flat_signal() {
        let segmenter = CbsSegmenter::new(&get_test_params());
        let x = vec![1.5; 1000];
        assert_eq!(segmenter.segment_ends(&x, 1), vec![1000]);
        assert!(segmenter.breakpoints(&x, 1).is_empty());
    }

    #[test]
    fn test_clear_step() {
        let segmenter = CbsSegmenter::new(&get_test_params());
        let mut x = vec![0.0; 500];
        x.extend(vec![5.0; 500]);
        assert_eq!(segmenter.segment_ends(&x, 1), vec![500, 1000]);
    }

    #[test]
    fn test_deterministic() {
        let segmenter = CbsSegmenter::new(&get_test_params());
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let x = (0..300)
            .map(|i| {
                let level = if (100..140).contains(&i) { 1.0 } else { 0.0 };
                level + rng.random::<f64>() - 0.5
            })
            .collect::<Vec<_>>();
        let a = segmenter.segment_ends(&x, 42);
        let b = segmenter.segment_ends(&x, 42);
        assert_eq!(a, b);
        assert_eq!(a.last(), Some(&300));
    }

    #[test]
    fn test_noisy_step_hybrid() {
        // The step is too small for the obvious significance shortcut, and the segment is longer
        // than nmin, so the split is accepted by the tail bound and the hybrid permutation test
        let x = get_noisy_step(600, 300, 0.18, 0);
        let segmenter = CbsSegmenter::new(&get_test_params());
        for seed in [1, 7, 42] {
            assert_eq!(segmenter.segment_ends(&x, seed), vec![299, 600]);
        }
    }

    #[test]
    fn test_noisy_step_permutation() {
        let x = get_noisy_step(150, 75, 0.3, 2010);
        let segmenter = CbsSegmenter::new(&get_test_params());
        for seed in [1, 7, 42] {
            assert_eq!(segmenter.segment_ends(&x, seed), vec![76, 150]);
        }
    }

    #[test]
    fn test_noise_only() {
        let x = get_noisy_step(600, 0, 0.0, 0);
        let segmenter = CbsSegmenter::new(&get_test_params());
        assert_eq!(segmenter.segment_ends(&x, 1), vec![600]);
    }

    #[test]
    fn test_short_and_empty_input() {
        let segmenter = CbsSegmenter::new(&get_test_params());
        assert!(segmenter.segment_ends(&[], 1).is_empty());
        assert_eq!(segmenter.segment_ends(&[1.0, 2.0, 3.0], 1), vec![3]);
    }

    #[test]
    fn test_undo_methods() {
        let mut x = vec![0.0; 100];
        x.extend(vec![5.0; 100]);
        for undo_method in [UndoMethod::Prune, UndoMethod::SdUndo] {
            let params = CbsParameters {
                undo_method,
                ..get_test_params()
            };
            let segmenter = CbsSegmenter::new(&params);
            let ends = segmenter.segment_ends(&x, 3);
            assert!(ends.len() <= 2);
            assert_eq!(ends.last(), Some(&200));
        }
    }

    #[test]
    fn test_validate() {
        assert!(validate_cbs_parameters(&CbsParameters::default()).is_ok());

        let params = CbsParameters {
            min_width: 6,
            ..Default::default()
        };
        assert!(validate_cbs_parameters(&params).is_err());

        let params = CbsParameters {
            nmin: 99,
            ..Default::default()
        };
        assert!(validate_cbs_parameters(&params).is_err());
    }
}
