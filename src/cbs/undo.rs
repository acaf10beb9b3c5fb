//! Post-segmentation heuristics to remove weakly supported CBS changepoints
//!
//! Both methods take and return segment end positions, where the last end is the total data
//! length. Neither method can increase the segment count.
//!

use itertools::Itertools;
use log::debug;

use crate::numeric_utils::{cumulative_sum, median, partial_sum_of_powers};
use crate::special_functions::lchoose;

/// Residual sum of squares of `x` around the segment means for the segments ending at each of
/// `cpts` followed by a final segment ending at `x.len()`
///
fn segmentation_rss(sum_table: &[f64], total_ssq: f64, cpts: &[usize]) -> f64 {
    let n = sum_table.len() - 1;
    let mut explained = 0.0;
    let mut start = 0;
    for &end in cpts.iter().chain(std::iter::once(&n)) {
        let len = (end - start) as f64;
        let s = sum_table[end] - sum_table[start];
        explained += s * s / len;
        start = end;
    }
    total_ssq - explained
}

/// Remove changepoints as long as the residual sum of squares stays within `1 + change_cutoff` of
/// the full segmentation
///
/// For each changepoint count, from one fewer than the input down to zero, the subset of input
/// changepoints with minimal residual sum of squares is found by exhaustive search. The search
/// stops at the first count for which even the best subset exceeds the cutoff, and the best
/// subset of the previous count is returned.
///
pub fn change_points_prune(x: &[f64], seg_ends: &[usize], change_cutoff: f64) -> Vec<usize> {
    let nseg = seg_ends.len();
    if nseg < 2 {
        return seg_ends.to_vec();
    }
    let n = x.len();
    assert_eq!(seg_ends.last(), Some(&n));

    let mut sum_table = vec![0.0];
    sum_table.extend(cumulative_sum(x));
    let total_ssq = partial_sum_of_powers(x, None, 2, 0, n);

    let cpts = &seg_ends[..(nseg - 1)];
    let rss_full = segmentation_rss(&sum_table, total_ssq, cpts);

    let mut best = cpts.to_vec();
    for cpt_count in (0..cpts.len()).rev() {
        debug!(
            "Prune searching {:.0} subsets of {} changepoints",
            lchoose(cpts.len() as f64, cpt_count as f64).exp(),
            cpt_count
        );
        let mut count_best: Option<(f64, Vec<usize>)> = None;
        for subset in cpts.iter().copied().combinations(cpt_count) {
            let rss = segmentation_rss(&sum_table, total_ssq, &subset);
            if count_best.as_ref().is_none_or(|(best_rss, _)| rss < *best_rss) {
                count_best = Some((rss, subset));
            }
        }
        let Some((rss, subset)) = count_best else {
            break;
        };
        if rss / rss_full > 1.0 + change_cutoff {
            break;
        }
        best = subset;
    }

    best.push(n);
    best
}

/// Repeatedly merge the adjacent segments with the smallest absolute difference in medians,
/// while that difference is below `trimmed_sd * change_sd`
///
/// All boundaries tied for the smallest difference are removed together.
///
pub fn change_points_sd_undo(
    x: &[f64],
    seg_ends: &[usize],
    trimmed_sd: f64,
    change_sd: f64,
) -> Vec<usize> {
    let change_sd = trimmed_sd * change_sd;
    let mut cpt_loc = seg_ends.to_vec();
    loop {
        let k = cpt_loc.len();
        if k <= 1 {
            break;
        }

        let seg_medians = (0..k)
            .map(|i| {
                let start = if i == 0 { 0 } else { cpt_loc[i - 1] };
                median(x, start, cpt_loc[i])
            })
            .collect::<Vec<_>>();
        let adjacent_diffs = seg_medians
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .collect::<Vec<_>>();
        let min_diff = adjacent_diffs.iter().copied().fold(f64::INFINITY, f64::min);
        if !(min_diff < change_sd) {
            break;
        }

        let mut index = 0;
        cpt_loc.retain(|_| {
            let keep = index >= adjacent_diffs.len() || adjacent_diffs[index] != min_diff;
            index += 1;
            keep
        });
    }
    cpt_loc
}
