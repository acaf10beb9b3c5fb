//! Maximal circular t-statistics and the significance tests used to accept a CBS split
//!

use rand::Rng;

use super::CbsParameters;

/// Number of grid points used to integrate the tail probability approximation
const TAIL_GRID_COUNT: usize = 100;

/// Convergence tolerance of the tail probability approximation
const TAIL_TOLERANCE: f64 = 1e-6;

/// Observed statistics are shrunk by this factor so that permutations reproducing the observed
/// arrangement count as rejections despite round-off
const OBSERVED_STAT_SHRINK: f64 = 0.99999;

/// The arc of a circularized segment with the maximal t-statistic
///
/// The arc covers positions `start..end` of the segment. A split at either end of the segment
/// reduces the arc to a single changepoint.
///
#[derive(Clone, Debug, PartialEq)]
pub struct MaxArc {
    /// Squared t-statistic of the arc versus its complement
    pub stat: f64,
    pub start: usize,
    pub end: usize,
}

/// Result of testing one segment for changepoints
///
/// Changepoint positions are given relative to the segment start.
///
#[derive(Clone, Debug, PartialEq)]
pub enum SplitDecision {
    NoSplit,
    OneSplit(usize),
    TwoSplit(usize, usize),
}

impl SplitDecision {
    pub fn change_points(&self) -> Vec<usize> {
        match *self {
            SplitDecision::NoSplit => Vec::new(),
            SplitDecision::OneSplit(x) => vec![x],
            SplitDecision::TwoSplit(x, y) => vec![x, y],
        }
    }
}

/// Cumulative sum with a leading zero, so that the sum of `x[i..j]` is `c[j] - c[i]`
fn get_cumsum_table(x: &[f64]) -> Vec<f64> {
    let mut c = Vec::with_capacity(x.len() + 1);
    c.push(0.0);
    let mut total = 0.0;
    for v in x {
        total += v;
        c.push(total);
    }
    c
}

/// Between-group sum of squares of arc `i..j` and its complement, for mean-centered data
///
fn arc_bss(cumsum: &[f64], n: usize, i: usize, j: usize) -> f64 {
    let k = (j - i) as f64;
    let nf = n as f64;
    let d = cumsum[j] - cumsum[i];
    d * d * nf / (k * (nf - k))
}

/// Convert the between-group sum of squares to the squared two-sample t-statistic
fn bss_to_tstat(bss: f64, tss: f64, n: usize) -> f64 {
    let tss = if tss <= bss + 0.0001 { bss + 1.0 } else { tss };
    bss / ((tss - bss) / (n as f64 - 2.0))
}

/// Update the running best arc with left-biased tie-breaking on `(i, j)`
fn update_best(best: &mut Option<(f64, usize, usize)>, bss: f64, i: usize, j: usize) {
    let replace = match *best {
        None => true,
        Some((best_bss, bi, bj)) => bss > best_bss || (bss == best_bss && (i, j) < (bi, bj)),
    };
    if replace {
        *best = Some((bss, i, j));
    }
}

/// Exhaustive search for the maximum between-group sum of squares, used to verify the blocked
/// search
#[cfg(test)]
fn max_arc_bss_exhaustive(cumsum: &[f64], min_width: usize) -> Option<(f64, usize, usize)> {
    let n = cumsum.len() - 1;
    let mut best = None;
    for i in 0..n {
        for j in (i + 1)..=n {
            let k = j - i;
            if k < min_width || n - k < min_width {
                continue;
            }
            update_best(&mut best, arc_bss(cumsum, n, i, j), i, j);
        }
    }
    best
}

struct CumsumBlock {
    start: usize,
    end: usize,
    min: f64,
    max: f64,
}

/// Find the arc maximizing the between-group sum of squares over all arcs whose length and
/// complement length are both at least `min_width`
///
/// The cumulative sum positions are divided into blocks of about `sqrt(n)` positions. An upper
/// bound on the statistic is found for each pair of blocks from the cumulative sum range in each
/// block, and block pairs are evaluated exactly in descending bound order until no remaining pair
/// can reach the current best value. The result is identical to the exhaustive search, including
/// the tie-break.
///
fn max_arc_bss_blocked(cumsum: &[f64], min_width: usize) -> Option<(f64, usize, usize)> {
    let n = cumsum.len() - 1;
    let min_width = min_width.max(1);
    if n < 2 * min_width {
        return None;
    }

    let pos_count = n + 1;
    let block_size = ((pos_count as f64).sqrt().ceil() as usize).max(1);
    let blocks = (0..pos_count)
        .step_by(block_size)
        .map(|start| {
            let end = (start + block_size).min(pos_count);
            let (min, max) = cumsum[start..end]
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            CumsumBlock {
                start,
                end,
                min,
                max,
            }
        })
        .collect::<Vec<_>>();

    let nf = n as f64;
    let min_k = min_width;
    let max_k = n - min_width;
    let mut block_pairs = Vec::new();
    for (a_index, a) in blocks.iter().enumerate() {
        for (b_index, b) in blocks.iter().enumerate().skip(a_index) {
            // Range of arc lengths j - i with i in block a, j in block b, and i < j
            let lo = if b.start > a.end - 1 {
                b.start - (a.end - 1)
            } else {
                1
            };
            let hi = (b.end - 1).saturating_sub(a.start);
            let lo = lo.max(min_k);
            let hi = hi.min(max_k);
            if lo > hi {
                continue;
            }
            let denom_lo = lo as f64 * (nf - lo as f64);
            let denom_hi = hi as f64 * (nf - hi as f64);
            let denom = denom_lo.min(denom_hi);
            let num = (b.max - a.min).abs().max((a.max - b.min).abs());
            let bound = num * num * nf / denom;
            block_pairs.push((bound * (1.0 + 1e-10), a_index, b_index));
        }
    }

    block_pairs.sort_by(|x, y| y.0.total_cmp(&x.0));

    let mut best = None;
    for (bound, a_index, b_index) in block_pairs {
        if let Some((best_bss, _, _)) = best
            && bound < best_bss
        {
            break;
        }
        let a = &blocks[a_index];
        let b = &blocks[b_index];
        for i in a.start..a.end {
            let j_start = b.start.max(i + min_k);
            let j_end = b.end.min(i + max_k + 1);
            for j in j_start..j_end {
                update_best(&mut best, arc_bss(cumsum, n, i, j), i, j);
            }
        }
    }
    best
}

/// Maximum between-group sum of squares over circular arcs with length in `[min_width, kmax]`
///
/// In linear coordinates these are the arcs of length at most `kmax` and the wrapped arcs, whose
/// complement is at most `kmax`.
///
fn max_arc_bss_limited(cumsum: &[f64], min_width: usize, kmax: usize) -> f64 {
    let n = cumsum.len() - 1;
    let min_width = min_width.max(1);
    if n < 2 * min_width {
        return 0.0;
    }
    let max_k = n - min_width;
    let mut best = 0.0f64;
    for i in 0..n {
        let short_end = (i + kmax.min(max_k)).min(n);
        for j in (i + min_width)..=short_end {
            best = best.max(arc_bss(cumsum, n, i, j));
        }
        let long_start = (i + n.saturating_sub(kmax))
            .max(i + kmax + 1)
            .max(i + min_width);
        let long_end = (i + max_k).min(n);
        for j in long_start..=long_end {
            best = best.max(arc_bss(cumsum, n, i, j));
        }
    }
    best
}

/// Maximal squared t-statistic over all arcs of mean-centered segment `x`
///
/// # Arguments
/// * `tss` - Total sum of squares of `x`
/// * `min_width` - Minimum length of both the arc and its complement
///
/// Returns None when the segment is too short to hold any valid arc
///
pub fn t_max_o(x: &[f64], tss: f64, min_width: usize) -> Option<MaxArc> {
    let n = x.len();
    let cumsum = get_cumsum_table(x);
    max_arc_bss_blocked(&cumsum, min_width).map(|(bss, start, end)| MaxArc {
        stat: bss_to_tstat(bss, tss, n),
        start,
        end,
    })
}

/// Maximal squared t-statistic for a permuted segment
pub fn t_max_p(px: &[f64], tss: f64, min_width: usize) -> f64 {
    let n = px.len();
    let cumsum = get_cumsum_table(px);
    match max_arc_bss_blocked(&cumsum, min_width) {
        Some((bss, _, _)) => bss_to_tstat(bss, tss, n),
        None => 0.0,
    }
}

/// Maximal squared t-statistic for a permuted segment, restricted to arcs of length at most `kmax`
pub fn h_t_max_p(px: &[f64], tss: f64, min_width: usize, kmax: usize) -> f64 {
    let n = px.len();
    let cumsum = get_cumsum_table(px);
    bss_to_tstat(max_arc_bss_limited(&cumsum, min_width, kmax), tss, n)
}

/// Overshoot correction function used in the tail probability approximation
///
fn nu(x: f64, tol: f64) -> f64 {
    use crate::special_functions::pnorm;

    if x <= 0.01 {
        return (-0.583 * x).exp();
    }

    let mut lnu1 = std::f64::consts::LN_2 - 2.0 * x.ln();
    let mut lnu0 = lnu1;
    for k in 1..10_000 {
        let dk = k as f64;
        lnu1 -= 2.0 * pnorm(-x * dk.sqrt() / 2.0, 0.0, 1.0, true) / dk;
        if lnu1 == 0.0 || ((lnu1 - lnu0) / lnu1).abs() <= tol {
            break;
        }
        lnu0 = lnu1;
    }
    lnu1.exp()
}

/// Integral of `1 / (t * (1 - t))^2` over the grid cell of width `dincr` centered on `t`
///
fn it1tsq(t: f64, dincr: f64) -> f64 {
    let antiderivative = |u: f64| -1.0 / u + 1.0 / (1.0 - u) + 2.0 * u.ln() - 2.0 * (1.0 - u).ln();
    let h = dincr / 2.0;
    antiderivative(t + h) - antiderivative(t - h)
}

/// Approximate tail probability of the maximal statistic over arcs with length fraction in
/// `[delta, 1 - delta]`
///
/// # Arguments
/// * `b` - Observed maximal statistic (not squared)
/// * `m` - Segment length
///
pub fn tail_p(b: f64, delta: f64, m: usize, ngrid: usize, tol: f64) -> f64 {
    let dincr = (0.5 - delta) / ngrid as f64;
    let bsqrtm = b / (m as f64).sqrt();
    let mut tl = delta + dincr / 2.0;
    let mut sum = 0.0;
    for _ in 0..ngrid {
        let x = bsqrtm / (tl * (1.0 - tl)).sqrt();
        let nux = nu(x, tol);
        sum += nux * nux * it1tsq(tl, dincr);
        tl += dincr;
    }

    // Two-sided test
    2.0 * 9.973557e-2 * b.powi(3) * (-b * b / 2.0).exp() * sum
}

/// Fill `px` with a uniform random permutation of `x`
fn permute_into<R: Rng>(x: &[f64], px: &mut [f64], rng: &mut R) {
    px.copy_from_slice(x);
    for i in (1..px.len()).rev() {
        let j = ((rng.random::<f64>() * (i + 1) as f64) as usize).min(i);
        px.swap(i, j);
    }
}

/// Two-sample permutation p-value for a difference in means between `x[..n1]` and `x[n1..]`
///
/// The smaller group is redrawn in each permutation.
///
pub fn t_perm_p<R: Rng>(n1: usize, n2: usize, x: &[f64], nperm: usize, rng: &mut R) -> f64 {
    let n = n1 + n2;
    assert_eq!(x.len(), n);
    if n1 == 0 || n2 == 0 || nperm == 0 {
        return 1.0;
    }

    let xsum1 = x[..n1].iter().sum::<f64>();
    let xsum2 = x[n1..].iter().sum::<f64>();
    let xbar = (xsum1 + xsum2) / n as f64;
    let (m, tstat) = if n1 <= n2 {
        (n1, OBSERVED_STAT_SHRINK * (xsum1 / n1 as f64 - xbar).abs())
    } else {
        (n2, OBSERVED_STAT_SHRINK * (xsum2 / n2 as f64 - xbar).abs())
    };

    let mut px = x.to_vec();
    let mut nrej = 0;
    for _ in 0..nperm {
        let mut nn = n;
        for i in ((n - m)..n).rev() {
            let j = ((rng.random::<f64>() * nn as f64) as usize).min(nn - 1);
            px.swap(i, j);
            nn -= 1;
        }
        let psum = px[(n - m)..].iter().sum::<f64>();
        if (psum / m as f64 - xbar).abs() >= tstat {
            nrej += 1;
        }
    }
    nrej as f64 / nperm as f64
}

/// Decide whether mean-centered segment `x` splits into 0, 1 or 2 new segments
///
/// # Arguments
/// * `tss` - Total sum of squares of `x`
/// * `sbdry` - Sequential boundary table for early stopping of the permutation test
/// * `hybrid` - If true, bound the p-value with the tail approximation and permute only over
///   short arcs
/// * `delta` - Minimum arc length fraction used by the tail approximation
///
pub fn find_change_points<R: Rng>(
    x: &[f64],
    tss: f64,
    params: &CbsParameters,
    sbdry: &[usize],
    hybrid: bool,
    delta: f64,
    rng: &mut R,
) -> SplitDecision {
    let n = x.len();
    let max_arc = match t_max_o(x, tss, params.min_width) {
        Some(x) => x,
        None => return SplitDecision::NoSplit,
    };

    let ostat1 = max_arc.stat.sqrt();
    let ostat = max_arc.stat * OBSERVED_STAT_SHRINK;
    if ostat1.is_nan() || ostat1 <= 0.1 {
        return SplitDecision::NoSplit;
    }

    let (i1, i2) = (max_arc.start, max_arc.end);
    let shorter_len = std::cmp::min(i2 - i1, n - i2 + i1);
    let is_obviously_significant = ostat1 >= 7.0 && shorter_len >= 10;

    if !is_obviously_significant {
        let nperm = params.nperm;
        let nrejc = if hybrid {
            let pval1 = tail_p(ostat1, delta, n, TAIL_GRID_COUNT, TAIL_TOLERANCE);
            if pval1.is_nan() || pval1 > params.alpha {
                return SplitDecision::NoSplit;
            }
            ((params.alpha - pval1) * nperm as f64) as usize
        } else {
            (params.alpha * nperm as f64) as usize
        };

        let mut k = nrejc * (nrejc + 1) / 2;
        let mut nrej = 0;
        let mut px = vec![0.0; n];
        for np in 1..=nperm {
            permute_into(x, &mut px, rng);
            let pstat = if hybrid {
                h_t_max_p(&px, tss, params.min_width, params.kmax)
            } else {
                t_max_p(&px, tss, params.min_width)
            };
            if ostat <= pstat {
                nrej += 1;
                k += 1;
            }
            if nrej > nrejc {
                return SplitDecision::NoSplit;
            }
            if sbdry.get(k).is_some_and(|&b| np >= b) {
                break;
            }
        }
    }

    if i2 == n {
        SplitDecision::OneSplit(i1)
    } else if i1 == 0 {
        SplitDecision::OneSplit(i2)
    } else {
        let left_significant =
            t_perm_p(i1, i2 - i1, &x[..i2], params.nperm, rng) <= params.alpha;
        let right_significant =
            t_perm_p(i2 - i1, n - i2, &x[i1..], params.nperm, rng) <= params.alpha;
        match (left_significant, right_significant) {
            (true, true) => SplitDecision::TwoSplit(i1, i2),
            (true, false) => SplitDecision::OneSplit(i1),
            (false, true) => SplitDecision::OneSplit(i2),
            (false, false) => SplitDecision::NoSplit,
        }
    }
}
