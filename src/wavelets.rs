//! Unbalanced Haar wavelet segmentation
//!
//! The signal is decomposed top-down into unbalanced Haar wavelets, where each split point is
//! chosen to maximize the magnitude of the wavelet coefficient on the current interval. Small
//! coefficients are removed by hard thresholding and the remaining breakpoints are read from the
//! reconstructed signal.
//!

use serde::{Deserialize, Serialize};

use crate::numeric_utils::{MAD_NORMAL_SCALE, mean, median_absolute_deviation};

/// Germline per-level threshold scaling is mapped into this range
const GERMLINE_MIN_LEVEL_SCALE: f64 = 0.8;
const GERMLINE_MAX_LEVEL_SCALE: f64 = 1.0;

/// Reconstructed values closer than this are treated as the same segment
const RECONSTRUCTION_TOLERANCE: f64 = 1e-10;

/// Maximum breakpoint shift during germline breakpoint refinement
const MAX_REFINEMENT_RADIUS: usize = 5;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WaveletParameters {
    pub threshold_lower: f64,
    pub threshold_upper: f64,
    pub mad_factor: f64,
    pub is_germline: bool,

    /// Signals with no more than this many bins are not segmented
    pub min_size: usize,
}

impl Default for WaveletParameters {
    fn default() -> Self {
        Self {
            threshold_lower: 5.0,
            threshold_upper: 80.0,
            mad_factor: 2.0,
            is_germline: false,
            min_size: 10,
        }
    }
}

/// One unbalanced Haar coefficient
///
/// The wavelet covers `start..=end`, with the positive part on `start..=split` and the negative
/// part on `split+1..=end`. `index` is unique within the decomposition, numbering coefficients
/// from 1 in level order.
///
#[derive(Clone, Debug, PartialEq)]
pub struct WaveletCoefficient {
    pub index: usize,
    pub value: f64,
    pub start: usize,
    pub split: usize,
    pub end: usize,
}

/// Unbalanced Haar decomposition, with coefficients stored by tree level
pub struct WaveletTree {
    pub levels: Vec<Vec<WaveletCoefficient>>,
    pub smooth: f64,
    pub len: usize,
}

/// Inner products of `x` with the unbalanced Haar vectors of every split point
///
/// Element `m - 1` of the result is the inner product for the split putting the first `m` values
/// on the positive side. The result has length `x.len() - 1`.
///
pub fn get_inner_prod_iter(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n < 2 {
        return Vec::new();
    }
    let nf = n as f64;

    let mut i_plus = vec![0.0; n - 1];
    let mut i_minus = vec![0.0; n - 1];
    i_plus[0] = (1.0 - 1.0 / nf).sqrt() * x[0];
    i_minus[0] = x[1..].iter().sum::<f64>() / (nf * nf - nf).sqrt();
    for m in 2..n {
        let mf = m as f64;
        i_plus[m - 1] = i_plus[m - 2] * ((mf - 1.0) * (nf - mf) / mf / (nf - mf + 1.0)).sqrt()
            + x[m - 1] * ((nf - mf) / mf / nf).sqrt();
        i_minus[m - 1] = i_minus[m - 2] * ((nf - mf + 1.0) * mf / (mf - 1.0) / (nf - mf)).sqrt()
            - x[m - 1] * (mf / nf / (nf - mf)).sqrt();
    }

    i_plus
        .into_iter()
        .zip(i_minus)
        .map(|(p, m)| p - m)
        .collect()
}

/// Select the split with maximal absolute inner product
///
/// Ties are broken by taking the median of the tied split points, rounded down.
///
/// Returns the length of the positive side of the selected split.
///
fn get_max_inner_prod_split(ipi: &[f64]) -> usize {
    assert!(!ipi.is_empty());
    let max_abs = ipi.iter().map(|v| v.abs()).fold(f64::NEG_INFINITY, f64::max);
    let tied = ipi
        .iter()
        .enumerate()
        .filter(|(_, v)| v.abs() == max_abs)
        .map(|(i, _)| i + 1)
        .collect::<Vec<_>>();
    let count = tied.len();
    if count == 0 {
        // Only reachable with NaN input
        return 1;
    }
    if count % 2 == 1 {
        tied[count / 2]
    } else {
        (tied[count / 2 - 1] + tied[count / 2]) / 2
    }
}

/// Find the best split of `x`, returning the positive side length and the coefficient value
pub fn get_inner_prod_max(x: &[f64]) -> (usize, f64) {
    let ipi = get_inner_prod_iter(x);
    let split = get_max_inner_prod_split(&ipi);
    (split, ipi[split - 1])
}

/// Build the unbalanced Haar decomposition of `x` best adapted to the signal
///
/// `x` must have at least two values.
///
pub fn find_best_unbalanced_haar_decomposition(x: &[f64]) -> WaveletTree {
    let n = x.len();
    assert!(n >= 2);

    let get_coefficient = |index: usize, start: usize, end: usize| {
        let (split_len, value) = get_inner_prod_max(&x[start..=end]);
        WaveletCoefficient {
            index,
            value,
            start,
            split: start + split_len - 1,
            end,
        }
    };

    let mut levels = vec![vec![get_coefficient(1, 0, n - 1)]];
    let mut next_index = 2;
    loop {
        let parent_level = &levels[levels.len() - 1];
        if !parent_level.iter().any(|c| c.end - c.start >= 2) {
            break;
        }

        let mut child_level = Vec::new();
        for parent in parent_level.iter() {
            if parent.split - parent.start >= 1 {
                child_level.push(get_coefficient(next_index, parent.start, parent.split));
                next_index += 1;
            }
            if parent.end - parent.split >= 2 {
                child_level.push(get_coefficient(next_index, parent.split + 1, parent.end));
                next_index += 1;
            }
        }
        levels.push(child_level);
    }

    let smooth = x.iter().sum::<f64>() / (n as f64).sqrt();
    WaveletTree {
        levels,
        smooth,
        len: n,
    }
}

/// Per-level threshold scale for germline mode
///
/// Levels are mapped linearly from their coefficient count into the germline scale range, with
/// the densest level receiving the lowest scale.
///
fn get_germline_level_scales(tree: &WaveletTree) -> Vec<f64> {
    let counts = tree.levels.iter().map(|l| l.len()).collect::<Vec<_>>();
    let min_count = counts.iter().copied().min().unwrap_or(0);
    let max_count = counts.iter().copied().max().unwrap_or(0);
    if max_count == min_count {
        return vec![GERMLINE_MAX_LEVEL_SCALE; counts.len()];
    }
    let range = (max_count - min_count) as f64;
    counts
        .iter()
        .map(|&c| {
            let frac = (c - min_count) as f64 / range;
            GERMLINE_MAX_LEVEL_SCALE - frac * (GERMLINE_MAX_LEVEL_SCALE - GERMLINE_MIN_LEVEL_SCALE)
        })
        .collect()
}

/// Zero every coefficient with magnitude below `threshold` times its level scale
///
/// All level scales are one unless `is_germline` is set.
///
pub fn hard_thresh(tree: &mut WaveletTree, threshold: f64, is_germline: bool) {
    let level_scales = if is_germline {
        get_germline_level_scales(tree)
    } else {
        vec![1.0; tree.levels.len()]
    };
    for (level, scale) in tree.levels.iter_mut().zip(level_scales) {
        let level_threshold = threshold * scale;
        for coefficient in level.iter_mut() {
            if coefficient.value.abs() < level_threshold {
                coefficient.value = 0.0;
            }
        }
    }
}

/// Rebuild the signal from the decomposition
pub fn get_reconstructed_vector(tree: &WaveletTree) -> Vec<f64> {
    let n = tree.len;
    let mut r = vec![tree.smooth / (n as f64).sqrt(); n];
    for coefficient in tree.levels.iter().flatten() {
        if coefficient.value == 0.0 {
            continue;
        }
        let len = (coefficient.end - coefficient.start + 1) as f64;
        let left_len = (coefficient.split - coefficient.start + 1) as f64;
        let right_len = (coefficient.end - coefficient.split) as f64;
        let left_value = coefficient.value * (1.0 / left_len - 1.0 / len).sqrt();
        let right_value = -coefficient.value * (1.0 / right_len - 1.0 / len).sqrt();
        for v in r[coefficient.start..=coefficient.split].iter_mut() {
            *v += left_value;
        }
        for v in r[(coefficient.split + 1)..=coefficient.end].iter_mut() {
            *v += right_value;
        }
    }
    r
}

/// Breakpoints at every position where the reconstructed signal changes value
///
/// Each breakpoint is the index of the first bin of a new segment.
///
pub fn get_segments(reconstructed: &[f64]) -> Vec<usize> {
    (1..reconstructed.len())
        .filter(|&i| (reconstructed[i] - reconstructed[i - 1]).abs() > RECONSTRUCTION_TOLERANCE)
        .collect()
}

/// Shift each breakpoint within a small window to maximize the two-sample mean difference
/// between the bordering segments
///
/// Each candidate position is scored by the size-weighted mean difference
/// `sqrt(n1 * n2 / (n1 + n2)) * |mean1 - mean2|`, which is the magnitude of the Haar coefficient
/// for that split. The window radius is the smaller of the maximum radius and half the length of
/// each bordering segment. The original position is kept unless another position is strictly
/// better.
///
pub fn refine_segments(x: &[f64], breakpoints: &[usize]) -> Vec<usize> {
    let n = x.len();
    let mut refined = Vec::with_capacity(breakpoints.len());
    for (i, &b) in breakpoints.iter().enumerate() {
        let a = if i == 0 { 0 } else { breakpoints[i - 1] };
        let c = breakpoints.get(i + 1).copied().unwrap_or(n);
        let radius = MAX_REFINEMENT_RADIUS.min((b - a) / 2).min((c - b) / 2);

        let score = |p: usize| {
            let left_len = (p - a) as f64;
            let right_len = (c - p) as f64;
            let weight = (left_len * right_len / (left_len + right_len)).sqrt();
            weight * (mean(&x[a..p]) - mean(&x[p..c])).abs()
        };
        let mut best_pos = b;
        let mut best_score = score(b);
        for p in (b - radius)..=(b + radius) {
            if p == b {
                continue;
            }
            let s = score(p);
            if s > best_score {
                best_pos = p;
                best_score = s;
            }
        }
        refined.push(best_pos);
    }
    refined.sort_unstable();
    refined.dedup();
    refined
}

/// Segment one chromosome with unbalanced Haar wavelets
///
/// Returns the index of the first bin of every segment after the first
///
pub fn haar_wavelets(x: &[f64], params: &WaveletParameters) -> Vec<usize> {
    let n = x.len();
    if n <= params.min_size || n < 2 {
        return Vec::new();
    }

    let mut tree = find_best_unbalanced_haar_decomposition(x);

    let sigma = (params.mad_factor * median_absolute_deviation(x, MAD_NORMAL_SCALE))
        .clamp(params.threshold_lower, params.threshold_upper);
    let threshold = sigma * (2.0 * (n as f64).ln()).sqrt();
    hard_thresh(&mut tree, threshold, params.is_germline);

    let reconstructed = get_reconstructed_vector(&tree);
    let breakpoints = get_segments(&reconstructed);
    if params.is_germline {
        refine_segments(x, &breakpoints)
    } else {
        breakpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_inner_prod(x: &[f64]) -> Vec<f64> {
        let n = x.len() as f64;
        (1..x.len())
            .map(|m| {
                let mf = m as f64;
                let left = x[..m].iter().sum::<f64>();
                let right = x[m..].iter().sum::<f64>();
                (1.0 / mf - 1.0 / n).sqrt() * left - (1.0 / (n - mf) - 1.0 / n).sqrt() * right
            })
            .collect()
    }

    #[test]
    fn test_inner_prod_iter() {
        let x = [1.0, 4.0, -2.0, 3.5, 0.0, 7.0, 2.0];
        let fast = get_inner_prod_iter(&x);
        let slow = brute_force_inner_prod(&x);
        assert_eq!(fast.len(), 6);
        for (a, b) in fast.iter().zip(slow.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert!(get_inner_prod_iter(&[1.0]).is_empty());
    }

    #[test]
    fn test_max_split_median_tie() {
        // Ties at splits 2, 4 and 5
        assert_eq!(get_max_inner_prod_split(&[1.0, -3.0, 2.0, 3.0, -3.0, 0.0]), 4);

        // Even tie count rounds down
        assert_eq!(get_max_inner_prod_split(&[3.0, 0.0, -3.0]), 2);
        assert_eq!(get_max_inner_prod_split(&[3.0, 0.0, 0.0, -3.0]), 2);

        assert_eq!(get_max_inner_prod_split(&[0.5, 2.0, 1.0]), 2);
    }

    #[test]
    fn test_perfect_reconstruction() {
        let x = [1.0, 4.0, -2.0, 3.5, 0.0, 7.0, 2.0, 2.0];
        let tree = find_best_unbalanced_haar_decomposition(&x);
        let r = get_reconstructed_vector(&tree);
        for (a, b) in x.iter().zip(r.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }

        // Coefficient indices are unique, numbered from 1 in level order
        let indices = tree.levels.iter().flatten().map(|c| c.index).collect::<Vec<_>>();
        assert_eq!(indices, (1..=indices.len()).collect::<Vec<_>>());
        assert_eq!(tree.levels[1][0].index, 2);
    }

    #[test]
    fn test_step_detection() {
        let mut x = vec![10.0; 40];
        x.extend(vec![60.0; 40]);
        for (i, v) in x.iter_mut().enumerate() {
            *v += if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let params = WaveletParameters::default();
        assert_eq!(haar_wavelets(&x, &params), vec![40]);

        let params = WaveletParameters {
            is_germline: true,
            ..Default::default()
        };
        assert_eq!(haar_wavelets(&x, &params), vec![40]);
    }

    #[test]
    fn test_short_input_bypass() {
        let x = [0.0, 0.0, 100.0, 100.0];
        let params = WaveletParameters::default();
        assert!(haar_wavelets(&x, &params).is_empty());
    }

    #[test]
    fn test_hard_thresh_germline_scales() {
        let x = (0..20).map(|i| (i * 7 % 11) as f64).collect::<Vec<_>>();
        let tree = find_best_unbalanced_haar_decomposition(&x);
        let scales = get_germline_level_scales(&tree);
        assert_eq!(scales.len(), tree.levels.len());
        assert!(
            scales
                .iter()
                .all(|&s| (GERMLINE_MIN_LEVEL_SCALE..=GERMLINE_MAX_LEVEL_SCALE).contains(&s))
        );
        assert_eq!(scales[0], GERMLINE_MAX_LEVEL_SCALE);
    }

    #[test]
    fn test_refine_segments() {
        // Breakpoint placed two bins early moves to the true step
        let mut x = vec![0.0; 20];
        x.extend(vec![10.0; 20]);
        assert_eq!(refine_segments(&x, &[18]), vec![20]);
        assert_eq!(refine_segments(&x, &[22]), vec![20]);
        assert_eq!(refine_segments(&x, &[20]), vec![20]);

        // Each breakpoint is refined within the segments bordering it
        let mut x = vec![0.0; 20];
        x.extend(vec![10.0; 20]);
        x.extend(vec![-5.0; 20]);
        assert_eq!(refine_segments(&x, &[17, 41]), vec![20, 40]);
    }
}
